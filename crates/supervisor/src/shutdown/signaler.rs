use std::{io::ErrorKind, time::Duration};

use tokio::{
	io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
	time::{sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::errors::ShutdownError;

use super::{platform, ShutdownChannel, EXIT_ACK, EXIT_COMMAND};

/// How long [`signal_exit()`] keeps trying to connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long [`signal_exit()`] waits for the acknowledgement once connected.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Ask the listener on `channel` to exit, logging and swallowing any failure.
///
/// Returns whether the request was acknowledged.
pub async fn signal_exit(channel: &ShutdownChannel) -> bool {
	match try_signal_exit(channel).await {
		Ok(()) => {
			info!(%channel, "exit request acknowledged");
			true
		}
		Err(err) => {
			warn!(%channel, %err, "exit request failed");
			false
		}
	}
}

/// Ask the listener on `channel` to exit.
///
/// Connecting is bounded by [`CONNECT_TIMEOUT`], during which a channel that doesn't exist yet is
/// retried. Writing the request and reading the reply is then bounded by [`EXCHANGE_TIMEOUT`].
pub async fn try_signal_exit(channel: &ShutdownChannel) -> Result<(), ShutdownError> {
	let mut conn = timeout(CONNECT_TIMEOUT, connect(channel))
		.await
		.map_err(|_| ShutdownError::Timeout {
			stage: "connecting",
		})??;
	debug!(%channel, "connected to shutdown channel");

	timeout(EXCHANGE_TIMEOUT, exchange(&mut conn))
		.await
		.map_err(|_| ShutdownError::Timeout {
			stage: "waiting for acknowledgement",
		})?
}

async fn connect(channel: &ShutdownChannel) -> Result<platform::Connection, ShutdownError> {
	loop {
		match platform::connect(channel.name()).await {
			Ok(conn) => return Ok(conn),
			Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
				trace!(%channel, %err, "shutdown channel not there yet");
			}
			Err(err) => {
				return Err(ShutdownError::Connect {
					channel: channel.to_string(),
					err,
				})
			}
		}

		sleep(CONNECT_RETRY).await;
	}
}

async fn exchange<S>(conn: &mut S) -> Result<(), ShutdownError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	conn.write_all(format!("{EXIT_COMMAND}\n").as_bytes())
		.await
		.map_err(|err| ShutdownError::Io {
			about: "write request",
			err,
		})?;
	conn.flush().await.map_err(|err| ShutdownError::Io {
		about: "flush request",
		err,
	})?;

	let mut reply = String::new();
	let read = BufReader::new(conn)
		.read_line(&mut reply)
		.await
		.map_err(|err| ShutdownError::Io {
			about: "read reply",
			err,
		})?;
	if read == 0 {
		return Err(ShutdownError::Closed);
	}

	let reply = reply.trim_end_matches(['\r', '\n']);
	if reply == EXIT_ACK {
		Ok(())
	} else {
		Err(ShutdownError::UnexpectedReply(reply.into()))
	}
}
