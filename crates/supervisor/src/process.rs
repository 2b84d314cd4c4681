//! Launched processes.

use std::{io, process::ExitStatus, time::Duration};

use futures::future::join_all;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::{
	io::{AsyncBufReadExt, AsyncRead, BufReader},
	select,
	sync::{broadcast, mpsc, watch},
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, trace, warn, Instrument, Span};

use crate::{errors::StartError, settings::SupervisorSettings};

/// How long output readers may lag behind the process's exit.
///
/// A grandchild holding the process's stdout open would otherwise delay the exit indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Read-only snapshot of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessInfo {
	/// OS process id.
	pub id: u32,

	/// Exit code, once the process has exited.
	///
	/// On Unix, a process ended by a signal has an exit code of 128 plus the signal number.
	pub exit_code: Option<i32>,
}

/// A live process, owned by the supervisor.
///
/// The process is reaped by a background task, which also carries out kill requests. Dropping the
/// handle kills the process if it's still running.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
	pid: u32,
	kill: mpsc::UnboundedSender<()>,
	exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
	/// Launch a process and start reaping it.
	///
	/// `on_exit` is called with the process id and exit code once the process has exited and its
	/// output was read out.
	pub fn spawn<F>(
		settings: &SupervisorSettings,
		output: &broadcast::Sender<String>,
		errors: &broadcast::Sender<String>,
		span: &Span,
		on_exit: F,
	) -> Result<Self, StartError>
	where
		F: FnOnce(u32, i32) + Send + 'static,
	{
		let start_error = |err: io::Error| StartError::new(settings.program.clone(), err);

		let mut child = settings.to_spawnable().spawn().map_err(start_error)?;
		let Some(pid) = child.id() else {
			return Err(start_error(io::Error::other(
				"process exited before its id could be read",
			)));
		};
		debug!(pid, "spawned process");

		let mut readers = Vec::with_capacity(2);
		if let Some(stdout) = child.stdout.take() {
			readers.push(read_lines(stdout, output.clone(), "stdout", span));
		}
		if let Some(stderr) = child.stderr.take() {
			readers.push(read_lines(stderr, errors.clone(), "stderr", span));
		}

		let (kill, mut kill_requests) = mpsc::unbounded_channel();
		let (exit_tx, exit) = watch::channel(None);

		tokio::spawn(
			async move {
				let status = loop {
					select! {
						status = child.wait() => break status,
						request = kill_requests.recv() => {
							if let Err(err) = child.start_kill() {
								warn!(%err, "failed to kill process");
							}
							if request.is_none() {
								trace!("handle dropped, process killed");
								break child.wait().await;
							}
						}
					}
				};

				let code = match status {
					Ok(status) => exit_code(status),
					Err(err) => {
						warn!(%err, "failed to wait on process");
						-1
					}
				};
				debug!(pid, code, "process exited");

				if timeout(OUTPUT_DRAIN_TIMEOUT, join_all(readers)).await.is_err() {
					debug!("output still open after exit, not waiting for it");
				}

				exit_tx.send_replace(Some(code));
				on_exit(pid, code);
			}
			.instrument(span.clone()),
		);

		Ok(Self { pid, kill, exit })
	}

	pub const fn pid(&self) -> u32 {
		self.pid
	}

	/// The exit code, once the process was reaped.
	pub fn exit_code(&self) -> Option<i32> {
		*self.exit.borrow()
	}

	/// Request the process be killed.
	///
	/// Returns false if the process already exited.
	pub fn kill(&self) -> bool {
		if self.exit_code().is_some() {
			return false;
		}

		self.kill.send(()).is_ok()
	}
}

fn read_lines<R>(
	stream: R,
	sink: broadcast::Sender<String>,
	name: &'static str,
	span: &Span,
) -> JoinHandle<()>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	tokio::spawn(
		async move {
			let mut lines = BufReader::new(stream).split(b'\n');
			loop {
				match lines.next_segment().await {
					Ok(Some(line)) => {
						let line = String::from_utf8_lossy(&line);
						let line = line.trim_end_matches('\r');
						trace!(stream = name, line, "read line");
						sink.send(line.to_owned()).ok();
					}
					Ok(None) => break,
					Err(err) => {
						debug!(stream = name, %err, "stopped reading output");
						break;
					}
				}
			}
		}
		.instrument(span.clone()),
	)
}

fn exit_code(status: ExitStatus) -> i32 {
	if let Some(code) = status.code() {
		return code;
	}

	#[cfg(unix)]
	{
		use std::os::unix::process::ExitStatusExt;
		if let Some(signal) = status.signal() {
			return 128 + signal;
		}
	}

	-1
}
