//! Error types.

use std::{
	io::{self, ErrorKind},
	path::PathBuf,
	sync::Arc,
};

use miette::Diagnostic;
use thiserror::Error;

/// Convenience type for a [`std::io::Error`] which can be shared across threads and cloned.
pub type SyncIoError = Arc<io::Error>;

/// The program of a supervisor could not be launched.
///
/// This is never returned from [`ProcessSupervisor::start()`](crate::ProcessSupervisor::start);
/// it is retained by the supervisor, which moves to
/// [`StartFailed`](crate::State::StartFailed), and can be read back with
/// [`ProcessSupervisor::start_error()`](crate::ProcessSupervisor::start_error).
#[derive(Debug, Clone, Diagnostic, Error)]
#[error("failed to start {}: {source}", program.display())]
#[diagnostic(code(procwarden::supervisor::start))]
pub struct StartError {
	/// The program which was being launched.
	pub program: PathBuf,

	/// The underlying I/O error.
	#[source]
	pub source: SyncIoError,
}

impl StartError {
	pub(crate) fn new(program: PathBuf, err: io::Error) -> Self {
		Self {
			program,
			source: Arc::new(err),
		}
	}

	/// The kind of the underlying I/O error.
	#[must_use]
	pub fn kind(&self) -> ErrorKind {
		self.source.kind()
	}
}

/// Why a queued operation did not produce its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Diagnostic, Error)]
#[non_exhaustive]
pub enum QueueError {
	/// The queue was disposed before the operation started.
	#[error("operation cancelled: queue disposed")]
	#[diagnostic(code(procwarden::queue::cancelled))]
	Cancelled,

	/// The operation panicked.
	#[error("operation panicked")]
	#[diagnostic(code(procwarden::queue::panicked))]
	Panicked,
}

/// A failed attempt at asking a process to exit over its shutdown channel.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ShutdownError {
	/// Could not connect to the channel.
	#[error("connect to {channel}: {err}")]
	#[diagnostic(code(procwarden::shutdown::connect))]
	Connect {
		/// Name of the channel.
		channel: String,

		/// The underlying error.
		#[source]
		err: io::Error,
	},

	/// A stage of the exchange did not complete in time.
	#[error("timed out while {stage}")]
	#[diagnostic(code(procwarden::shutdown::timeout))]
	Timeout {
		/// What was being waited on.
		stage: &'static str,
	},

	/// I/O error once connected.
	#[error("io({about}): {err}")]
	#[diagnostic(code(procwarden::shutdown::io))]
	Io {
		/// What it was about.
		about: &'static str,

		/// The underlying error.
		#[source]
		err: io::Error,
	},

	/// The listener hung up without replying.
	#[error("channel closed before acknowledgement")]
	#[diagnostic(code(procwarden::shutdown::closed))]
	Closed,

	/// The listener replied with something other than `OK`.
	#[error("unexpected reply: {0:?}")]
	#[diagnostic(code(procwarden::shutdown::unexpected_reply))]
	UnexpectedReply(String),
}
