//! How to launch a supervised process.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	process::Stdio,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;
use tracing::trace;

/// Immutable launch descriptor for a [`ProcessSupervisor`](crate::ProcessSupervisor).
///
/// Built with [`new()`](Self::new) and the `with_*` methods:
///
/// ```
/// # use procwarden_supervisor::SupervisorSettings;
/// let settings = SupervisorSettings::new("/srv/app", "/srv/app/bin/server")
///     .with_args(["--port", "8080", "--name", "my server"])
///     .with_env("RUST_LOG", "info")
///     .with_capture_stderr(true);
///
/// assert_eq!(settings.arguments, r#"--port 8080 --name "my server""#);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SupervisorSettings {
	/// Directory the process is started in.
	pub working_directory: PathBuf,

	/// Executable to launch.
	pub program: PathBuf,

	/// Argument string, split with [`split_arguments()`].
	#[cfg_attr(feature = "serde", serde(default))]
	pub arguments: String,

	/// Environment variables set on top of the inherited environment.
	#[cfg_attr(feature = "serde", serde(default))]
	pub environment: BTreeMap<String, String>,

	/// Whether to capture standard error as error lines, instead of inheriting it.
	#[cfg_attr(feature = "serde", serde(default))]
	pub capture_stderr: bool,
}

impl SupervisorSettings {
	/// Settings for running `program` from `working_directory`, with no arguments.
	pub fn new(working_directory: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
		Self {
			working_directory: working_directory.into(),
			program: program.into(),
			..Default::default()
		}
	}

	/// Set the raw argument string.
	#[must_use]
	pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
		self.arguments = arguments.into();
		self
	}

	/// Set the argument string from a list of arguments, quoting them as needed.
	#[must_use]
	pub fn with_args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		self.arguments = join_arguments(args);
		self
	}

	/// Add an environment variable, replacing any previous value for the key.
	#[must_use]
	pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.environment.insert(key.into(), value.into());
		self
	}

	/// Set whether standard error is captured.
	#[must_use]
	pub const fn with_capture_stderr(mut self, capture: bool) -> Self {
		self.capture_stderr = capture;
		self
	}

	/// The argument vector the process will be launched with.
	#[must_use]
	pub fn argv(&self) -> Vec<String> {
		split_arguments(&self.arguments)
	}

	/// Obtain a [`tokio::process::Command`].
	///
	/// Standard output is always piped, standard error only if [`capture_stderr`] is set, and
	/// standard input is null. The process is killed if the child handle is dropped.
	///
	/// [`capture_stderr`]: Self::capture_stderr
	pub fn to_spawnable(&self) -> TokioCommand {
		trace!(settings=?self, "constructing command");

		let mut cmd = TokioCommand::new(&self.program);
		cmd.args(self.argv())
			.current_dir(self.resolved_working_directory())
			.envs(&self.environment)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(if self.capture_stderr {
				Stdio::piped()
			} else {
				Stdio::inherit()
			})
			.kill_on_drop(true);
		cmd
	}

	fn resolved_working_directory(&self) -> &Path {
		if self.working_directory.as_os_str().is_empty() {
			Path::new(".")
		} else {
			&self.working_directory
		}
	}
}

/// Split an argument string into arguments.
///
/// Whitespace separates arguments, double quotes group (and are removed), and `\"` is a literal
/// double quote. Backslashes are literal unless they precede a double quote: then each pair is one
/// backslash, and an odd one out escapes the quote.
#[must_use]
pub fn split_arguments(arguments: &str) -> Vec<String> {
	let mut args = Vec::new();
	let mut current = String::new();
	let mut in_token = false;
	let mut quoted = false;
	let mut chars = arguments.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'\\' => {
				let mut backslashes = 1;
				while chars.next_if_eq(&'\\').is_some() {
					backslashes += 1;
				}

				if chars.peek() == Some(&'"') {
					current.extend(std::iter::repeat('\\').take(backslashes / 2));
					if backslashes % 2 == 1 {
						chars.next();
						current.push('"');
					}
				} else {
					current.extend(std::iter::repeat('\\').take(backslashes));
				}
				in_token = true;
			}
			'"' => {
				quoted = !quoted;
				in_token = true;
			}
			c if c.is_whitespace() && !quoted => {
				if in_token {
					args.push(std::mem::take(&mut current));
					in_token = false;
				}
			}
			c => {
				current.push(c);
				in_token = true;
			}
		}
	}

	if in_token {
		args.push(current);
	}

	args
}

/// Join arguments into a string that [`split_arguments()`] turns back into the same list.
#[must_use]
pub fn join_arguments<I, S>(args: I) -> String
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut joined = String::new();
	for arg in args {
		let arg = arg.as_ref();
		if !joined.is_empty() {
			joined.push(' ');
		}

		let quote = arg.is_empty() || arg.chars().any(char::is_whitespace);
		if quote {
			joined.push('"');
		}

		let mut backslashes = 0;
		for c in arg.chars() {
			match c {
				'\\' => backslashes += 1,
				'"' => {
					push_backslashes(&mut joined, backslashes * 2 + 1);
					joined.push('"');
					backslashes = 0;
				}
				c => {
					push_backslashes(&mut joined, backslashes);
					joined.push(c);
					backslashes = 0;
				}
			}
		}

		if quote {
			push_backslashes(&mut joined, backslashes * 2);
			joined.push('"');
		} else {
			push_backslashes(&mut joined, backslashes);
		}
	}
	joined
}

fn push_backslashes(out: &mut String, count: usize) {
	out.extend(std::iter::repeat('\\').take(count));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_on_whitespace() {
		assert_eq!(split_arguments("  a b\tc\n"), vec!["a", "b", "c"]);
		assert!(split_arguments("").is_empty());
	}

	#[test]
	fn quotes_group() {
		assert_eq!(
			split_arguments(r#"--name "my server" x"y z"w"#),
			vec!["--name", "my server", "xy zw"]
		);
		assert_eq!(split_arguments(r#"a "" b"#), vec!["a", "", "b"]);
	}

	#[test]
	fn escaped_quotes() {
		assert_eq!(split_arguments(r#"say \"hi\""#), vec!["say", "\"hi\""]);
		assert_eq!(split_arguments(r"C:\path\to"), vec![r"C:\path\to"]);
	}

	#[test]
	fn join_then_split() {
		let args = ["plain", "with space", "", "quo\"te", "tab\there"];
		assert_eq!(split_arguments(&join_arguments(args)), args);
	}

	#[test]
	fn join_then_split_trailing_backslashes() {
		let args = [
			r"C:\Program Files\",
			"next",
			r"back\\slashes\\",
			r#"esc\"aped"#,
			r"\\server\share",
			r"bare\",
		];
		let joined = join_arguments(args);
		assert_eq!(split_arguments(&joined), args, "joined: {joined}");
	}

	#[test]
	fn backslashes_before_quotes() {
		assert_eq!(split_arguments(r#""a b\\" c"#), vec![r"a b\", "c"]);
		assert_eq!(split_arguments(r#"x\\\"y"#), vec![r#"x\"y"#]);
		assert_eq!(split_arguments(r"a\\b"), vec![r"a\\b"]);
	}

	#[test]
	fn builder() {
		let settings = SupervisorSettings::new("/tmp", "/bin/true")
			.with_arguments("-a -b")
			.with_env("A", "1")
			.with_env("A", "2")
			.with_capture_stderr(true);
		assert_eq!(settings.argv(), vec!["-a", "-b"]);
		assert_eq!(settings.environment.get("A").map(String::as_str), Some("2"));
		assert!(settings.capture_stderr);
	}
}
