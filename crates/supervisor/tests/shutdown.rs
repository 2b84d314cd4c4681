use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use procwarden_supervisor::{
	shutdown::{
		signal_exit, try_signal_exit, ListenOutcome, ShutdownChannel, ShutdownListener,
		CHANNEL_PREFIX,
	},
	ShutdownError,
};
use tokio::time::timeout;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(10);

fn unique_channel() -> ShutdownChannel {
	ShutdownChannel::named(format!("procwarden-test-{}", uuid::Uuid::new_v4()))
}

fn counting_listener(channel: ShutdownChannel) -> (ShutdownListener, Arc<AtomicUsize>) {
	let calls = Arc::new(AtomicUsize::new(0));
	let listener = ShutdownListener::listen(channel, {
		let calls = calls.clone();
		move || {
			calls.fetch_add(1, Ordering::SeqCst);
		}
	})
	.unwrap();
	(listener, calls)
}

#[test]
fn channel_names() {
	assert_eq!(ShutdownChannel::for_process(1234).name(), "procwarden-1234");
	assert_eq!(CHANNEL_PREFIX, "procwarden");
	assert_eq!(
		ShutdownChannel::current_process(),
		ShutdownChannel::for_process(std::process::id())
	);
	assert_eq!(ShutdownChannel::named("custom").to_string(), "custom");
}

#[tokio::test]
#[traced_test]
async fn acknowledges_then_calls_back() {
	let channel = unique_channel();
	let (listener, calls) = counting_listener(channel.clone());

	try_signal_exit(&channel).await.unwrap();

	assert_eq!(
		timeout(WAIT, listener.finished()).await.unwrap(),
		ListenOutcome::ShutdownRequested
	);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(listener.outcome(), Some(ListenOutcome::ShutdownRequested));
}

#[tokio::test]
async fn signaler_waits_for_listener_to_appear() {
	let channel = unique_channel();
	let signal = tokio::spawn({
		let channel = channel.clone();
		async move { signal_exit(&channel).await }
	});

	tokio::time::sleep(Duration::from_millis(300)).await;
	let (listener, calls) = counting_listener(channel);

	assert!(timeout(WAIT, signal).await.unwrap().unwrap());
	assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_listener_times_out() {
	let channel = unique_channel();

	let err = try_signal_exit(&channel).await.unwrap_err();
	assert!(
		matches!(err, ShutdownError::Timeout { stage: "connecting" }),
		"unexpected error: {err:?}"
	);
	assert!(!signal_exit(&channel).await);
}

#[tokio::test]
async fn stop_cancels_without_calling_back() {
	let channel = unique_channel();
	let (listener, calls) = counting_listener(channel.clone());

	listener.stop();

	assert_eq!(
		timeout(WAIT, listener.finished()).await.unwrap(),
		ListenOutcome::Cancelled
	);
	assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn drop_releases_the_channel() {
	let channel = unique_channel();
	let (listener, _) = counting_listener(channel.clone());
	drop(listener);
	tokio::time::sleep(Duration::from_millis(100)).await;

	let (listener, calls) = counting_listener(channel.clone());
	try_signal_exit(&channel).await.unwrap();
	assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
mod raw {
	use tokio::{
		io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
		net::UnixStream,
	};

	use super::*;

	async fn connect(channel: &ShutdownChannel) -> UnixStream {
		UnixStream::connect(std::env::temp_dir().join(format!("{}.sock", channel.name())))
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn ignores_other_lines_and_reconnects() {
		let channel = unique_channel();
		let (listener, calls) = counting_listener(channel.clone());

		let mut first = connect(&channel).await;
		first.write_all(b"HELLO\nSTATUS\n").await.unwrap();
		first.flush().await.unwrap();
		drop(first);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert_eq!(listener.outcome(), None);

		let mut second = BufReader::new(connect(&channel).await);
		second.write_all(b"PING\r\nEXIT\r\n").await.unwrap();
		second.flush().await.unwrap();

		let mut reply = String::new();
		timeout(WAIT, second.read_line(&mut reply))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(reply, "OK\n");

		assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn ignores_binary_noise_on_the_same_connection() {
		let channel = unique_channel();
		let (listener, calls) = counting_listener(channel.clone());

		let mut conn = BufReader::new(connect(&channel).await);
		conn.write_all(b"\xff\xfe\n").await.unwrap();
		conn.write_all(b"EXIT\n").await.unwrap();
		conn.flush().await.unwrap();

		let mut reply = String::new();
		timeout(WAIT, conn.read_line(&mut reply))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(reply, "OK\n");

		assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn skips_overlong_lines() {
		let channel = unique_channel();
		let (listener, calls) = counting_listener(channel.clone());

		let mut conn = BufReader::new(connect(&channel).await);
		let mut noise = vec![b'x'; 64 * 1024];
		noise.extend_from_slice(b"EXIT\n");
		conn.write_all(&noise).await.unwrap();
		conn.flush().await.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert_eq!(listener.outcome(), None);

		conn.write_all(b"EXIT\n").await.unwrap();
		conn.flush().await.unwrap();

		let mut reply = String::new();
		timeout(WAIT, conn.read_line(&mut reply))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(reply, "OK\n");
		assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn replaces_stale_socket() {
		let channel = unique_channel();
		let path = std::env::temp_dir().join(format!("{}.sock", channel.name()));
		drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
		assert!(path.exists());

		let (listener, _) = counting_listener(channel.clone());
		try_signal_exit(&channel).await.unwrap();
		assert_eq!(listener.finished().await, ListenOutcome::ShutdownRequested);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn refuses_live_channel() {
		let channel = unique_channel();
		let (_listener, _) = counting_listener(channel.clone());

		let err = ShutdownListener::listen(channel, || {}).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
	}
}
