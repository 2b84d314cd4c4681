//! Serialising queue for operations, including asynchronous ones.
//!
//! The [`OperationQueue`] runs operations strictly one at a time, in the order they were enqueued.
//! There is no dedicated task behind it: the first operation to enter an idle queue spawns a drain
//! loop on the Tokio runtime, which runs until the queue is empty and then exits. An atomic flag
//! ensures only one drain loop ever exists at a time.
//!
//! Enqueueing returns a [`Ticket`], a future which resolves with the operation's output once it has
//! run. Tickets don't need to be polled for operations to make progress, and dropping a ticket does
//! not cancel its operation.

use std::{
	fmt,
	future::Future,
	panic::AssertUnwindSafe,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	task::{Context, Poll},
};

use crossbeam_queue::SegQueue;
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Instrument, Span};

use crate::errors::QueueError;

type Operation = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// A FIFO queue which runs one operation at a time.
///
/// This struct is cloneable (internally it is an Arc); all clones feed the same queue.
///
/// Enqueueing spawns onto the current Tokio runtime, and so must happen from within one.
#[derive(Clone)]
pub struct OperationQueue {
	inner: Arc<Inner>,
}

struct Inner {
	items: SegQueue<Operation>,
	draining: AtomicBool,
	disposed: CancellationToken,
	span: Span,
}

impl fmt::Debug for OperationQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("OperationQueue")
			.field("pending", &self.inner.items.len())
			.field("draining", &self.inner.draining.load(Ordering::Relaxed))
			.field("disposed", &self.inner.disposed.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Default for OperationQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl OperationQueue {
	/// Create a queue logging under a new `operation_queue` span of the current span.
	#[must_use]
	pub fn new() -> Self {
		Self::with_span(tracing::debug_span!("operation_queue"))
	}

	/// Create a queue whose drain loop is instrumented with the given span.
	#[must_use]
	pub fn with_span(span: Span) -> Self {
		Self {
			inner: Arc::new(Inner {
				items: SegQueue::new(),
				draining: AtomicBool::new(false),
				disposed: CancellationToken::new(),
				span,
			}),
		}
	}

	/// Enqueue a synchronous action.
	pub fn enqueue<F>(&self, op: F) -> Ticket<()>
	where
		F: FnOnce() + Send + 'static,
	{
		self.enqueue_fn(op)
	}

	/// Enqueue a synchronous function, whose return value the ticket resolves to.
	pub fn enqueue_fn<F, T>(&self, op: F) -> Ticket<T>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		self.enqueue_async_fn(move |_| async move { op() })
	}

	/// Enqueue an asynchronous action.
	///
	/// The action is given the queue's disposal token, which it may observe to end early.
	pub fn enqueue_async<F, Fut>(&self, op: F) -> Ticket<()>
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		self.enqueue_async_fn(op)
	}

	/// Enqueue an asynchronous function, whose output the ticket resolves to.
	///
	/// All other `enqueue` methods are implemented on top of this one.
	pub fn enqueue_async_fn<F, Fut, T>(&self, op: F) -> Ticket<T>
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		if self.is_disposed() {
			debug!("queue disposed, not enqueueing");
			return Ticket::cancelled();
		}

		let (tx, rx) = oneshot::channel();
		self.inner.items.push(Box::new(move |token: CancellationToken| {
			async move {
				if token.is_cancelled() {
					trace!("queue disposed, skipping operation");
					tx.send(Err(QueueError::Cancelled)).ok();
					return;
				}

				let outcome = AssertUnwindSafe(async move { op(token).await })
					.catch_unwind()
					.await
					.map_err(|_| {
						error!("queued operation panicked");
						QueueError::Panicked
					});
				tx.send(outcome).ok();
			}
			.boxed()
		}));

		self.schedule();
		Ticket { rx: Some(rx) }
	}

	/// Dispose of the queue.
	///
	/// Operations which haven't started yet resolve as [cancelled](QueueError::Cancelled), and so
	/// will any enqueued later. An operation which is currently running is not interrupted, but it
	/// can observe the cancellation through the token it was given.
	pub fn dispose(&self) {
		debug!(pending = self.inner.items.len(), "disposing operation queue");
		self.inner.disposed.cancel();
	}

	/// Whether [`dispose()`](Self::dispose) was called.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.is_cancelled()
	}

	fn schedule(&self) {
		if self
			.inner
			.draining
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			let inner = self.inner.clone();
			let span = inner.span.clone();
			tokio::spawn(async move { inner.drain().await }.instrument(span));
		}
	}
}

impl Inner {
	async fn drain(&self) {
		trace!("drain loop started");
		loop {
			while let Some(op) = self.items.pop() {
				op(self.disposed.clone()).await;
			}

			self.draining.store(false, Ordering::SeqCst);

			// an enqueue may have slipped in between the last pop and releasing the flag, and seen
			// the flag still set: in that case we must be the one to pick it up
			if self.items.is_empty()
				|| self
					.draining
					.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
					.is_err()
			{
				break;
			}
		}
		trace!("drain loop finished");
	}
}

/// A future which resolves when a queued operation has run.
///
/// Resolves to [`QueueError::Cancelled`] if the queue was disposed before the operation started,
/// and to [`QueueError::Panicked`] if the operation panicked.
#[derive(Debug)]
#[must_use = "tickets do nothing unless awaited, but dropping one does not cancel its operation"]
pub struct Ticket<T> {
	rx: Option<oneshot::Receiver<Result<T, QueueError>>>,
}

impl<T> Ticket<T> {
	/// A ticket which resolves immediately as cancelled.
	pub fn cancelled() -> Self {
		Self { rx: None }
	}
}

impl<T> Future for Ticket<T> {
	type Output = Result<T, QueueError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let Some(rx) = self.rx.as_mut() else {
			return Poll::Ready(Err(QueueError::Cancelled));
		};

		Pin::new(rx)
			.poll(cx)
			.map(|res| res.unwrap_or(Err(QueueError::Cancelled)))
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc, Mutex,
		},
		time::Duration,
	};

	use tokio::{sync::Notify, time::sleep};

	use super::*;

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn runs_in_enqueue_order() {
		let queue = OperationQueue::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		let mut tickets = Vec::new();
		for n in 0..100 {
			let seen = seen.clone();
			tickets.push(queue.enqueue(move || seen.lock().unwrap().push(n)));
		}
		for ticket in tickets {
			ticket.await.unwrap();
		}

		assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn never_runs_two_at_once() {
		let queue = OperationQueue::new();
		let running = Arc::new(AtomicUsize::new(0));
		let overlapped = Arc::new(AtomicUsize::new(0));

		let mut tickets = Vec::new();
		for _ in 0..20 {
			let running = running.clone();
			let overlapped = overlapped.clone();
			tickets.push(queue.enqueue_async(move |_| async move {
				if running.fetch_add(1, Ordering::SeqCst) != 0 {
					overlapped.fetch_add(1, Ordering::SeqCst);
				}
				sleep(Duration::from_millis(2)).await;
				running.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for ticket in tickets {
			ticket.await.unwrap();
		}

		assert_eq!(overlapped.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn returns_values() {
		let queue = OperationQueue::new();
		assert_eq!(queue.enqueue_fn(|| 42).await, Ok(42));
		assert_eq!(
			queue
				.enqueue_async_fn(|_| async { "async".to_string() })
				.await
				.as_deref(),
			Ok("async")
		);
	}

	#[tokio::test]
	async fn restarts_after_draining() {
		let queue = OperationQueue::new();
		queue.enqueue(|| ()).await.unwrap();
		sleep(Duration::from_millis(10)).await;
		assert!(!queue.inner.draining.load(Ordering::SeqCst));
		assert_eq!(queue.enqueue_fn(|| 2).await, Ok(2));
	}

	#[tokio::test]
	async fn dispose_cancels_pending_but_not_running() {
		let queue = OperationQueue::new();
		let gate = Arc::new(Notify::new());
		let started = Arc::new(Notify::new());

		let first = queue.enqueue_async_fn({
			let gate = gate.clone();
			let started = started.clone();
			move |token| async move {
				started.notify_one();
				gate.notified().await;
				token.is_cancelled()
			}
		});
		let second = queue.enqueue_fn(|| "never");

		started.notified().await;
		queue.dispose();
		gate.notify_one();

		assert_eq!(first.await, Ok(true), "running operation completes and sees disposal");
		assert_eq!(second.await, Err(QueueError::Cancelled));
		assert_eq!(queue.enqueue_fn(|| 1).await, Err(QueueError::Cancelled));
	}

	#[tokio::test]
	async fn panic_does_not_stall_queue() {
		let queue = OperationQueue::new();
		let bad = queue.enqueue(|| panic!("boom"));
		let good = queue.enqueue_fn(|| 7);

		assert_eq!(bad.await, Err(QueueError::Panicked));
		assert_eq!(good.await, Ok(7));
	}

	#[tokio::test]
	async fn dropped_ticket_still_runs() {
		let queue = OperationQueue::new();
		let count = Arc::new(AtomicUsize::new(0));

		drop(queue.enqueue({
			let count = count.clone();
			move || {
				count.fetch_add(1, Ordering::SeqCst);
			}
		}));
		queue.enqueue(|| ()).await.unwrap();

		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn cancelled_ticket() {
		assert_eq!(Ticket::<()>::cancelled().await, Err(QueueError::Cancelled));
	}
}
