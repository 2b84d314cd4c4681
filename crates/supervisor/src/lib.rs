//! Procwarden's process supervisor.
//!
//! This crate launches a single OS process, tracks its lifecycle through a small state machine,
//! and stops it either cooperatively, by asking it to exit over a named channel, or forcibly, by
//! killing it. It also provides the other half of that arrangement: what a supervised process
//! runs to hear exit requests, and to notice that its own parent went away.
//!
//! # Usage
//!
//! A supervisor is constructed from [`SupervisorSettings`], which describe how to launch the
//! process: working directory, program, argument string, environment overrides, and whether to
//! capture standard error. [`ProcessSupervisor::start()`] launches it, and
//! [`ProcessSupervisor::stop()`] stops it, with or without a cooperative shutdown timeout.
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")] async fn main() { // single-threaded for doctest only
//! use std::time::Duration;
//! use procwarden_supervisor::{ProcessSupervisor, State, SupervisorSettings};
//!
//! let supervisor = ProcessSupervisor::new(
//!     SupervisorSettings::new("/srv/app", "/srv/app/bin/server").with_args(["--port", "8080"]),
//! );
//!
//! supervisor.start().await.unwrap();
//! assert_eq!(supervisor.state(), State::Running);
//!
//! let stopped = supervisor.when_state_is(State::ExitedSuccessfully);
//! supervisor.stop(Some(Duration::from_secs(5))).await.unwrap();
//! stopped.await;
//! # }
//! ```
//!
//! On the other side, a process which wants to be stopped gracefully runs a
//! [`ShutdownListener`](shutdown::ShutdownListener) on its own channel, and a
//! [`ParentMonitor`](parent::ParentMonitor) on the process id its supervisor passed it in
//! [`PARENT_PID_ENV`](parent::PARENT_PID_ENV):
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")] async fn main() { // single-threaded for doctest only
//! use procwarden_supervisor::{parent::ParentMonitor, shutdown::ShutdownListener};
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let _listener = ShutdownListener::for_current_process({
//!     let shutdown = shutdown.clone();
//!     move || shutdown.cancel()
//! }).unwrap();
//! let _monitor = ParentMonitor::start(None, {
//!     let shutdown = shutdown.clone();
//!     move |_| shutdown.cancel()
//! });
//!
//! shutdown.cancelled().await;
//! # }
//! ```
//!
//! # Theory of Operation
//!
//! The supervisor's state only ever changes in response to a [`Trigger`]: `Start`, `StartError`,
//! `Stop`, and `ProcessExit`. The table of permitted transitions lives in [`state`]; a trigger
//! which has no transition from the current state is logged and ignored.
//!
//! Triggers arrive from different places: the API user calls `start()` and `stop()`, while
//! `ProcessExit` comes from the task reaping the process. To keep them from interleaving, every
//! trigger is pushed through an [`OperationQueue`](queue::OperationQueue), which runs operations
//! strictly one at a time in arrival order. Methods which enqueue return a
//! [`Ticket`](queue::Ticket), a future resolving once the operation has run. Dropping a ticket
//! does not cancel the operation.
//!
//! Stopping with a timeout is the one place where waiting happens. The `Stop` trigger moves the
//! supervisor to `Stopping` and then spawns the cooperative stop outside the queue: it calls
//! [`signal_exit()`](shutdown::signal_exit) against the process's channel, bounded by the timeout,
//! and then waits, bounded by the timeout again, for `ProcessExit` to move the supervisor to an
//! exited state. If either runs out, a kill is enqueued. Because the queue is free during that
//! wait, the `ProcessExit` trigger can be applied. Which exited state is reached depends on
//! whether the process was killed and on its exit code.
//!
//! Exit detection for processes which are not children, like a parent, is done by the
//! [`ExitWatcher`](exit::ExitWatcher), which guarantees its callback runs exactly once even if the
//! process exits while the watcher is attaching.
//!
//! # Logging
//!
//! Logging is done with [`tracing`]. Components don't log to a global logger; they take a span
//! when constructed (by default a child of the current span), and instrument every task they
//! spawn with it.

#![warn(clippy::unwrap_used, missing_docs, rustdoc::unescaped_backticks)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(rust_2018_idioms)]

#[doc(inline)]
pub use crate::{
	errors::{QueueError, ShutdownError, StartError},
	process::ProcessInfo,
	settings::SupervisorSettings,
	state::{State, Trigger, TriggerKind},
	supervisor::{ProcessSupervisor, StateChange},
};

pub mod errors;
pub mod exit;
pub mod parent;
pub mod queue;
pub mod settings;
pub mod shutdown;
pub mod state;

mod process;
mod supervisor;
