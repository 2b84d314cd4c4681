use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use procwarden_supervisor::exit::{process_exists, ExitWatcher};
use tokio::{sync::oneshot, time::timeout};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(10);

fn counter() -> (Arc<AtomicUsize>, impl FnOnce(u32) + Send + 'static) {
	let calls = Arc::new(AtomicUsize::new(0));
	let callback = {
		let calls = calls.clone();
		move |_| {
			calls.fetch_add(1, Ordering::SeqCst);
		}
	};
	(calls, callback)
}

#[tokio::test]
#[traced_test]
async fn nonexistent_process_fires_immediately() {
	let (calls, callback) = counter();
	let watcher = ExitWatcher::watch(u32::MAX, callback);

	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert!(watcher.has_fired());
	assert_eq!(watcher.pid(), u32::MAX);

	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pid_zero_is_no_process() {
	let (calls, callback) = counter();
	let _watcher = ExitWatcher::watch(0, callback);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert!(!process_exists(0));
}

#[tokio::test]
async fn live_process_does_not_fire() {
	let (calls, callback) = counter();
	let watcher = ExitWatcher::watch(std::process::id(), callback);

	tokio::time::sleep(Duration::from_millis(600)).await;
	assert_eq!(calls.load(Ordering::SeqCst), 0);
	assert!(!watcher.has_fired());
	assert!(process_exists(std::process::id()));

	drop(watcher);
	assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
mod children {
	use tokio::process::Command;

	use super::*;

	#[tokio::test]
	async fn fires_when_process_is_killed() {
		let mut child = Command::new("sleep").arg("30").spawn().unwrap();
		let pid = child.id().unwrap();

		let (tx, rx) = oneshot::channel();
		let watcher = ExitWatcher::watch(pid, move |pid| {
			tx.send(pid).unwrap();
		});
		assert!(!watcher.has_fired());

		child.kill().await.unwrap();
		assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap(), pid);
		assert!(watcher.has_fired());
	}

	#[tokio::test]
	async fn fires_when_process_exits_on_its_own() {
		let mut child = Command::new("sleep").arg("0.5").spawn().unwrap();
		let pid = child.id().unwrap();
		let (calls, callback) = counter();

		let _watcher = ExitWatcher::watch(pid, callback);
		child.wait().await.unwrap();

		timeout(WAIT, async {
			while calls.load(Ordering::SeqCst) == 0 {
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		})
		.await
		.unwrap();

		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn process_exiting_while_subscribing_fires_once() {
		let mut watched = Vec::new();
		for _ in 0..50 {
			let mut child = Command::new("true").spawn().unwrap();
			let pid = child.id().unwrap();
			let (calls, callback) = counter();

			let watcher = ExitWatcher::watch(pid, callback);
			child.wait().await.unwrap();

			timeout(WAIT, async {
				while !watcher.has_fired() {
					tokio::time::sleep(Duration::from_millis(10)).await;
				}
			})
			.await
			.unwrap();
			watched.push((watcher, calls));
		}

		// let any stray poll ticks run before counting
		tokio::time::sleep(Duration::from_millis(300)).await;
		for (_, calls) in &watched {
			assert_eq!(calls.load(Ordering::SeqCst), 1);
		}
	}

	#[tokio::test]
	async fn already_reaped_process_fires_immediately() {
		let mut child = Command::new("true").spawn().unwrap();
		let pid = child.id().unwrap();
		child.wait().await.unwrap();

		let (calls, callback) = counter();
		let watcher = ExitWatcher::watch(pid, callback);

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(watcher.has_fired());
	}
}
