use std::{ffi::OsString, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueHint};
use procwarden_supervisor::parent::PARENT_PID_ENV;

pub use self::logging::LoggingArgs;

pub(crate) mod logging;

const OPTSET_LAUNCH: &str = "Launch options";
const OPTSET_STOPPING: &str = "Stopping options";
const OPTSET_DEBUGGING: &str = "Debugging options";

/// Environment variable naming the shutdown channel of `procwarden child`.
pub const PIPE_NAME_ENV: &str = "PROCWARDEN_PIPE_NAME";

/// Run programs under supervision, and stop them cooperatively.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	#[command(subcommand)]
	pub command: Command,

	#[command(flatten)]
	pub logging: LoggingArgs,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
	/// Run a program under supervision
	///
	/// The program's output is echoed line by line. On Ctrl-C, the program is asked to exit over
	/// its shutdown channel, and killed if it doesn't within the stop timeout. Procwarden then
	/// exits with the program's exit code.
	///
	/// The program is given its supervisor's process id in $PROCWARDEN_PARENT_PID, so that it can
	/// exit if procwarden goes away.
	Run(RunArgs),

	/// Run as a cooperative child process
	///
	/// Listens for exit requests on the channel named after its process id, and watches its parent
	/// process. Exits when asked to, when the parent exits, when its lifetime runs out, or on
	/// Ctrl-C, whichever comes first.
	Child(ChildArgs),

	/// Print the supervisor's state machine as a Graphviz diagram
	Diagram,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
	/// Program to run, and its arguments
	#[arg(
		trailing_var_arg = true,
		num_args = 1..,
		required = true,
		value_name = "PROGRAM",
	)]
	pub program: Vec<OsString>,

	/// Working directory of the program
	///
	/// Defaults to the current directory.
	#[arg(
		long,
		short = 'w',
		help_heading = OPTSET_LAUNCH,
		value_hint = ValueHint::DirPath,
		value_name = "DIRECTORY",
	)]
	pub workdir: Option<PathBuf>,

	/// Add an environment variable to the program
	///
	/// Use multiple times to set multiple variables.
	#[arg(
		long = "env",
		short = 'E',
		help_heading = OPTSET_LAUNCH,
		value_name = "KEY=VALUE",
		value_parser = parse_env,
	)]
	pub env: Vec<(String, String)>,

	/// Capture the program's standard error
	///
	/// Captured lines are echoed to procwarden's own standard error. Without this, the program
	/// writes to the terminal directly.
	#[arg(long, help_heading = OPTSET_LAUNCH)]
	pub capture_stderr: bool,

	/// Time to wait for the program to exit cooperatively
	///
	/// The program is first given this long to acknowledge the exit request, then this long again
	/// to exit. Set to zero to kill it immediately.
	///
	/// Takes a unit-less value in seconds, or a time span value such as "2min 5s".
	#[arg(
		long,
		help_heading = OPTSET_STOPPING,
		default_value = "5s",
		value_parser = parse_duration,
		value_name = "TIMEOUT",
	)]
	pub stop_timeout: Duration,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ChildArgs {
	/// Process id of the parent to watch
	#[arg(long, env = PARENT_PID_ENV, value_name = "PID")]
	pub parent_pid: Option<u32>,

	/// Listen on this channel instead of the one named after the process id
	#[arg(long, env = PIPE_NAME_ENV, value_name = "NAME")]
	pub pipe_name: Option<String>,

	/// Acknowledge exit requests but keep running
	#[arg(long, help_heading = OPTSET_DEBUGGING)]
	pub ignore_exit_signal: bool,

	/// Exit code to exit with
	#[arg(long, default_value = "0", value_name = "CODE")]
	pub exit_code: u8,

	/// Exit on its own after this long
	#[arg(
		long,
		default_value = "100s",
		value_parser = parse_duration,
		value_name = "DURATION",
	)]
	pub lifetime: Duration,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
	match s.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.into(), value.into())),
		_ => Err(format!("expected KEY=VALUE, got {s:?}")),
	}
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
	if let Ok(secs) = s.parse::<u64>() {
		return Ok(Duration::from_secs(secs));
	}

	humantime::parse_duration(s)
}
