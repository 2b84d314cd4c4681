use std::{io, time::Duration};

use tokio::{
	io::{
		AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
		BufReader,
	},
	select,
	sync::watch,
	time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use super::{platform, ShutdownChannel, EXIT_ACK, EXIT_COMMAND};

/// Longest command line read; anything longer is skipped as noise.
const MAX_LINE_LENGTH: u64 = 1024;

/// How a [`ShutdownListener`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
	/// An `EXIT` request was acknowledged and the shutdown callback invoked.
	ShutdownRequested,

	/// The listener was stopped or dropped first.
	Cancelled,
}

/// Listens for one `EXIT` request on a [`ShutdownChannel`].
///
/// The listening task runs in the background from [`listen()`](Self::listen) until either a
/// request is acknowledged or the listener is stopped. Dropping the listener stops it.
#[derive(Debug)]
pub struct ShutdownListener {
	channel: ShutdownChannel,
	cancel: CancellationToken,
	outcome: watch::Receiver<Option<ListenOutcome>>,
}

impl ShutdownListener {
	/// Start listening on `channel`, calling `on_shutdown` once an `EXIT` was acknowledged.
	///
	/// The channel is claimed before this returns, so a signaler may connect right away. Must be
	/// called from within a Tokio runtime.
	pub fn listen<F>(channel: ShutdownChannel, on_shutdown: F) -> io::Result<Self>
	where
		F: FnOnce() + Send + 'static,
	{
		Self::listen_with_span(
			channel.clone(),
			tracing::debug_span!("shutdown_listener", %channel),
			on_shutdown,
		)
	}

	/// Listen on the channel named after the current process id.
	pub fn for_current_process<F>(on_shutdown: F) -> io::Result<Self>
	where
		F: FnOnce() + Send + 'static,
	{
		Self::listen(ShutdownChannel::current_process(), on_shutdown)
	}

	/// Like [`listen()`](Self::listen), logging under the given span.
	pub fn listen_with_span<F>(
		channel: ShutdownChannel,
		span: Span,
		on_shutdown: F,
	) -> io::Result<Self>
	where
		F: FnOnce() + Send + 'static,
	{
		let server = span.in_scope(|| platform::Server::bind(channel.name()))?;
		let cancel = CancellationToken::new();
		let (outcome_tx, outcome) = watch::channel(None);

		tokio::spawn({
			let cancel = cancel.clone();
			async move {
				let outcome = listen_loop(server, cancel, on_shutdown).await;
				debug!(?outcome, "shutdown listener finished");
				outcome_tx.send_replace(Some(outcome));
			}
			.instrument(span)
		});

		Ok(Self {
			channel,
			cancel,
			outcome,
		})
	}

	/// The channel this listens on.
	#[must_use]
	pub const fn channel(&self) -> &ShutdownChannel {
		&self.channel
	}

	/// Stop listening.
	///
	/// Pending waits are cancelled, but an acknowledgement already being written is not.
	pub fn stop(&self) {
		self.cancel.cancel();
	}

	/// How the listener finished, if it has.
	#[must_use]
	pub fn outcome(&self) -> Option<ListenOutcome> {
		*self.outcome.borrow()
	}

	/// Wait until the listener finishes.
	pub async fn finished(&self) -> ListenOutcome {
		let mut outcome = self.outcome.clone();
		let result = outcome.wait_for(Option::is_some).await.map(|o| *o);
		match result {
			Ok(Some(outcome)) => outcome,
			// the task went away without reporting, which only happens if the runtime is shutting down
			Ok(None) | Err(_) => ListenOutcome::Cancelled,
		}
	}
}

impl Drop for ShutdownListener {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

async fn listen_loop<F>(
	mut server: platform::Server,
	cancel: CancellationToken,
	on_shutdown: F,
) -> ListenOutcome
where
	F: FnOnce() + Send + 'static,
{
	loop {
		let accepted = select! {
			biased;
			() = cancel.cancelled() => return ListenOutcome::Cancelled,
			accepted = server.accept() => accepted,
		};

		let mut conn = match accepted {
			Ok(conn) => conn,
			Err(err) => {
				warn!(%err, "failed to accept shutdown connection, listening again");
				sleep(Duration::from_millis(50)).await;
				continue;
			}
		};
		trace!("shutdown channel connected");

		let requested = select! {
			biased;
			() = cancel.cancelled() => return ListenOutcome::Cancelled,
			requested = wait_for_exit(&mut conn) => requested,
		};

		match requested {
			Ok(true) => {
				if let Err(err) = acknowledge(&mut conn).await {
					warn!(%err, "failed to acknowledge exit request, shutting down anyway");
				}
				info!("exit requested over shutdown channel");
				on_shutdown();
				return ListenOutcome::ShutdownRequested;
			}
			Ok(false) => debug!("shutdown client disconnected without a request"),
			Err(err) => warn!(%err, "shutdown connection failed, listening again"),
		}
	}
}

async fn wait_for_exit<S>(conn: &mut S) -> io::Result<bool>
where
	S: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(conn);
	let mut line = Vec::with_capacity(16);
	loop {
		line.clear();
		let read = (&mut reader)
			.take(MAX_LINE_LENGTH)
			.read_until(b'\n', &mut line)
			.await?;
		if read == 0 {
			return Ok(false);
		}

		if line.last() != Some(&b'\n') {
			if read as u64 == MAX_LINE_LENGTH {
				trace!(length = read, "skipping overlong line");
				skip_line(&mut reader).await?;
				continue;
			}

			// eof in the middle of a line
			return Ok(false);
		}

		let command = line.strip_suffix(b"\n").unwrap_or(&line[..]);
		let command = command.strip_suffix(b"\r").unwrap_or(command);
		if command == EXIT_COMMAND.as_bytes() {
			return Ok(true);
		}
		trace!(line = %String::from_utf8_lossy(command), "ignoring unknown shutdown command");
	}
}

/// Discard input up to and including the next newline, without buffering it.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
	R: AsyncBufRead + Unpin,
{
	loop {
		let buf = reader.fill_buf().await?;
		if buf.is_empty() {
			return Ok(());
		}

		if let Some(end) = buf.iter().position(|&b| b == b'\n') {
			reader.consume(end + 1);
			return Ok(());
		}

		let len = buf.len();
		reader.consume(len);
	}
}

async fn acknowledge<S>(conn: &mut S) -> io::Result<()>
where
	S: AsyncWrite + Unpin,
{
	conn.write_all(format!("{EXIT_ACK}\n").as_bytes()).await?;
	conn.flush().await
}
