//! Cooperative shutdown over a named inter-process channel.
//!
//! A process which wants to be stopped gracefully runs a [`ShutdownListener`] on a channel named
//! after its own process id. Whoever wants it to stop calls [`signal_exit()`] with the same
//! channel: this connects, writes `EXIT`, and waits for `OK`. The listener replies `OK` before
//! invoking its shutdown callback, exactly once.
//!
//! The wire protocol is newline-delimited text. Lines other than `EXIT` are ignored by the
//! listener, and a client which disconnects before sending `EXIT` just makes the listener wait for
//! the next connection.
//!
//! On Unix the channel is a Unix domain socket in the temporary directory; on Windows it is a
//! named pipe.

use std::fmt;

#[doc(inline)]
pub use self::{
	listener::{ListenOutcome, ShutdownListener},
	signaler::{signal_exit, try_signal_exit, CONNECT_TIMEOUT, EXCHANGE_TIMEOUT},
};

mod listener;
mod signaler;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;
#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// Prefix of channel names derived from a process id.
pub const CHANNEL_PREFIX: &str = "procwarden";

/// Line sent to request an exit.
pub const EXIT_COMMAND: &str = "EXIT";

/// Line sent back to acknowledge an exit request.
pub const EXIT_ACK: &str = "OK";

/// The name of a shutdown channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShutdownChannel {
	name: String,
}

impl ShutdownChannel {
	/// The channel of the process with this id: `procwarden-<pid>`.
	#[must_use]
	pub fn for_process(pid: u32) -> Self {
		Self::named(format!("{CHANNEL_PREFIX}-{pid}"))
	}

	/// The channel of the current process.
	#[must_use]
	pub fn current_process() -> Self {
		Self::for_process(std::process::id())
	}

	/// A channel with an arbitrary name.
	pub fn named(name: impl Into<String>) -> Self {
		Self { name: name.into() }
	}

	/// The channel's name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}
}

impl fmt::Display for ShutdownChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name)
	}
}
