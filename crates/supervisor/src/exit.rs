//! Watching arbitrary processes for their exit.
//!
//! An [`ExitWatcher`] observes a process by id, which need not be a child of the current process,
//! and invokes a callback exactly once when the process is found to have exited or to never have
//! existed in the first place.
//!
//! Three moments are checked, so that a process which exits while the watcher attaches is never
//! missed:
//!
//! 1. the process is looked up: if there is none, the callback runs immediately;
//! 2. the exit notification is subscribed to: if that fails because the process is gone, the
//!    callback runs immediately;
//! 3. the process is checked again right after subscribing: if it's gone, the callback runs.
//!
//! Otherwise the callback runs when the notification arrives. The callback is held in an
//! [`AtomicTake`] so that whichever of these gets there first is the only one to call it.
//!
//! On Linux the notification is a pidfd registered with the Tokio reactor. Other Unixes poll for the
//! process's existence, and Windows polls a process handle.

use std::{fmt, sync::Arc, time::Duration};

use atomic_take::AtomicTake;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;
#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// How often exit is polled for, where it can't be waited on directly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

type ExitCallback = Box<dyn FnOnce(u32) + Send>;

/// Watches a process and calls back once when it exits.
///
/// Dropping the watcher stops watching; the callback is then never called if it wasn't already.
pub struct ExitWatcher {
	pid: u32,
	callback: Arc<AtomicTake<ExitCallback>>,
	task: Option<JoinHandle<()>>,
}

impl fmt::Debug for ExitWatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExitWatcher")
			.field("pid", &self.pid)
			.field("exited", &self.has_fired())
			.finish_non_exhaustive()
	}
}

impl ExitWatcher {
	/// Watch `pid`, calling `on_exit` with it once it exits.
	///
	/// If the process doesn't exist or already exited, `on_exit` is called before this returns.
	/// Must be called from within a Tokio runtime.
	pub fn watch<F>(pid: u32, on_exit: F) -> Self
	where
		F: FnOnce(u32) + Send + 'static,
	{
		Self::watch_with_span(pid, tracing::debug_span!("exit_watcher", pid), on_exit)
	}

	/// Like [`watch()`](Self::watch), logging under the given span.
	pub fn watch_with_span<F>(pid: u32, span: Span, on_exit: F) -> Self
	where
		F: FnOnce(u32) + Send + 'static,
	{
		let callback: Arc<AtomicTake<ExitCallback>> =
			Arc::new(AtomicTake::new(Box::new(on_exit)));
		let fire = {
			let callback = callback.clone();
			move |reason: &'static str| {
				if let Some(on_exit) = callback.take() {
					info!(pid, reason, "process exited");
					on_exit(pid);
				}
			}
		};

		let entered = span.enter();
		let process = match platform::Process::open(pid) {
			Ok(Some(process)) => process,
			Ok(None) => {
				fire("no such process");
				return Self::finished(pid, callback);
			}
			Err(err) => {
				warn!(%err, "could not subscribe to process exit, treating it as gone");
				fire("not observable");
				return Self::finished(pid, callback);
			}
		};

		if process.has_exited() {
			fire("exited while subscribing");
			return Self::finished(pid, callback);
		}

		debug!("watching for process exit");
		drop(entered);
		let task = tokio::spawn(
			async move {
				process.exited().await;
				fire("exit notification");
			}
			.instrument(span),
		);

		Self {
			pid,
			callback,
			task: Some(task),
		}
	}

	const fn finished(pid: u32, callback: Arc<AtomicTake<ExitCallback>>) -> Self {
		Self {
			pid,
			callback,
			task: None,
		}
	}

	/// The watched process id.
	#[must_use]
	pub const fn pid(&self) -> u32 {
		self.pid
	}

	/// Whether the callback was called.
	#[must_use]
	pub fn has_fired(&self) -> bool {
		self.callback.is_taken()
	}
}

impl Drop for ExitWatcher {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// Whether a process with this id exists and has not exited.
#[must_use]
pub fn process_exists(pid: u32) -> bool {
	matches!(platform::Process::open(pid), Ok(Some(process)) if !process.has_exited())
}
