//! Reacting to the disappearance of a parent process.
//!
//! A supervised process which must not outlive its supervisor runs a [`ParentMonitor`]: it watches
//! the parent's process id with an [`ExitWatcher`] and invokes a host callback, typically one
//! starting a graceful shutdown, once the parent is gone.
//!
//! The parent's id comes from configuration or, failing that, from the [`PARENT_PID_ENV`]
//! environment variable, which [`ProcessSupervisor`](crate::ProcessSupervisor) users are expected
//! to set on the processes they launch.

use tracing::{info, warn, Span};

use crate::exit::ExitWatcher;

/// Environment variable carrying the parent process id.
pub const PARENT_PID_ENV: &str = "PROCWARDEN_PARENT_PID";

/// What to do when no parent process id is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingParent {
	/// Don't monitor anything.
	#[default]
	Ignore,

	/// Treat the parent as gone, invoking the callback immediately.
	Exit,
}

/// Watches the parent process and calls back once it exits.
///
/// Dropping the monitor stops watching.
#[derive(Debug)]
pub struct ParentMonitor {
	parent_pid: Option<u32>,
	watcher: Option<ExitWatcher>,
}

impl ParentMonitor {
	/// Monitor `parent_pid`, or the one in [`PARENT_PID_ENV`] if `None`.
	///
	/// Without either, nothing is monitored and a warning is logged.
	pub fn start<F>(parent_pid: Option<u32>, on_parent_exit: F) -> Self
	where
		F: FnOnce(Option<u32>) + Send + 'static,
	{
		Self::with_options(
			parent_pid,
			MissingParent::Ignore,
			tracing::debug_span!("parent_monitor"),
			on_parent_exit,
		)
	}

	/// Monitor with explicit handling of an unknown parent, logging under the given span.
	pub fn with_options<F>(
		parent_pid: Option<u32>,
		missing: MissingParent,
		span: Span,
		on_parent_exit: F,
	) -> Self
	where
		F: FnOnce(Option<u32>) + Send + 'static,
	{
		let parent_pid = span.in_scope(|| {
			resolve_parent_pid(parent_pid, |key| std::env::var(key).ok())
		});

		let Some(pid) = parent_pid else {
			span.in_scope(|| match missing {
				MissingParent::Ignore => {
					warn!("no parent process id, parent monitoring is disabled");
				}
				MissingParent::Exit => {
					info!("no parent process id, treating parent as gone");
					on_parent_exit(None);
				}
			});
			return Self {
				parent_pid: None,
				watcher: None,
			};
		};

		info!(parent: &span, pid, "monitoring parent process");
		let watcher = ExitWatcher::watch_with_span(pid, span, move |pid| {
			on_parent_exit(Some(pid));
		});

		Self {
			parent_pid: Some(pid),
			watcher: Some(watcher),
		}
	}

	/// The parent process id being monitored, if any.
	#[must_use]
	pub const fn parent_pid(&self) -> Option<u32> {
		self.parent_pid
	}

	/// Whether the parent was seen to exit.
	#[must_use]
	pub fn parent_exited(&self) -> bool {
		self.watcher.as_ref().is_some_and(ExitWatcher::has_fired)
	}
}

/// Pick the parent process id: `explicit` if given, else [`PARENT_PID_ENV`] as read by `lookup`.
///
/// An unparseable environment value is ignored with a warning.
pub fn resolve_parent_pid<L>(explicit: Option<u32>, lookup: L) -> Option<u32>
where
	L: FnOnce(&str) -> Option<String>,
{
	if explicit.is_some() {
		return explicit;
	}

	let value = lookup(PARENT_PID_ENV)?;
	match value.trim().parse() {
		Ok(pid) => Some(pid),
		Err(err) => {
			warn!(var = PARENT_PID_ENV, ?value, %err, "ignoring unparseable parent process id");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use tracing_test::traced_test;

	use super::*;

	#[test]
	fn explicit_wins() {
		assert_eq!(
			resolve_parent_pid(Some(12), |_| Some("34".into())),
			Some(12)
		);
	}

	#[test]
	fn falls_back_to_env() {
		assert_eq!(
			resolve_parent_pid(None, |key| {
				assert_eq!(key, PARENT_PID_ENV);
				Some(" 34\n".into())
			}),
			Some(34)
		);
		assert_eq!(resolve_parent_pid(None, |_| None), None);
	}

	#[test]
	#[traced_test]
	fn garbage_env_is_ignored() {
		assert_eq!(resolve_parent_pid(None, |_| Some("nope".into())), None);
		assert!(logs_contain("ignoring unparseable parent process id"));
	}

	#[tokio::test]
	async fn unknown_parent_fires_immediately() {
		let calls = Arc::new(AtomicUsize::new(0));
		let monitor = ParentMonitor::with_options(Some(u32::MAX), MissingParent::Exit, Span::none(), {
			let calls = calls.clone();
			move |pid| {
				assert_eq!(pid, Some(u32::MAX));
				calls.fetch_add(1, Ordering::SeqCst);
			}
		});

		// u32::MAX is not a valid pid anywhere, so the watcher fires right away
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(monitor.parent_exited());
		assert_eq!(monitor.parent_pid(), Some(u32::MAX));
	}

	#[tokio::test]
	async fn live_parent_does_not_fire() {
		let calls = Arc::new(AtomicUsize::new(0));
		let monitor = ParentMonitor::start(Some(std::process::id()), {
			let calls = calls.clone();
			move |_| {
				calls.fetch_add(1, Ordering::SeqCst);
			}
		});

		tokio::time::sleep(std::time::Duration::from_millis(300)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert!(!monitor.parent_exited());
	}
}
