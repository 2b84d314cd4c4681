//! The process supervisor.

use std::{
	fmt,
	future::Future,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use tokio::{
	select,
	sync::{broadcast, watch},
	task::JoinHandle,
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::{
	errors::{QueueError, StartError},
	process::{ProcessHandle, ProcessInfo},
	queue::{OperationQueue, Ticket},
	settings::SupervisorSettings,
	shutdown::{signal_exit, ShutdownChannel},
	state::{next_state, GuardContext, State, Trigger},
};

const OUTPUT_CAPACITY: usize = 1024;
const CHANGES_CAPACITY: usize = 64;

/// A transition of the supervisor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
	/// State before the transition.
	pub from: State,

	/// State after the transition.
	pub to: State,
}

/// Supervises one process at a time, through the [`State`] machine.
///
/// Every trigger, whether it comes from [`start()`](Self::start), [`stop()`](Self::stop), or the
/// OS reporting that the process exited, is applied through an [`OperationQueue`], so transitions
/// happen strictly one at a time and in the order they were requested.
///
/// Observers can read the current state, subscribe to state changes, and receive the process's
/// output line by line. Dropping the supervisor disposes of its queue and kills the process if it
/// is still running.
pub struct ProcessSupervisor {
	shared: Arc<Shared>,
}

struct Shared {
	settings: SupervisorSettings,
	queue: OperationQueue,
	core: Mutex<Core>,
	state: watch::Sender<State>,
	changes: broadcast::Sender<StateChange>,
	output: broadcast::Sender<String>,
	errors: broadcast::Sender<String>,
	dropped: CancellationToken,
	span: Span,
}

#[derive(Default)]
struct Core {
	process: Option<ProcessHandle>,
	info: Option<ProcessInfo>,
	killed: bool,
	start_error: Option<StartError>,
	cooperative_stop: Option<JoinHandle<()>>,
}

impl fmt::Debug for ProcessSupervisor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProcessSupervisor")
			.field("settings", &self.shared.settings)
			.field("state", &self.state())
			.field("process", &self.process_info())
			.finish_non_exhaustive()
	}
}

impl ProcessSupervisor {
	/// Create a supervisor for the process described by `settings`, in [`State::NotStarted`].
	///
	/// Logs under a new `supervisor` span of the current span.
	#[must_use]
	pub fn new(settings: SupervisorSettings) -> Self {
		let span = tracing::debug_span!("supervisor", program = %settings.program.display());
		Self::with_span(settings, span)
	}

	/// Create a supervisor logging under the given span.
	#[must_use]
	pub fn with_span(settings: SupervisorSettings, span: Span) -> Self {
		let (state, _) = watch::channel(State::NotStarted);
		Self {
			shared: Arc::new(Shared {
				settings,
				queue: OperationQueue::with_span(span.clone()),
				core: Mutex::new(Core::default()),
				state,
				changes: broadcast::channel(CHANGES_CAPACITY).0,
				output: broadcast::channel(OUTPUT_CAPACITY).0,
				errors: broadcast::channel(OUTPUT_CAPACITY).0,
				dropped: CancellationToken::new(),
				span,
			}),
		}
	}

	/// The settings this supervisor launches with.
	#[must_use]
	pub fn settings(&self) -> &SupervisorSettings {
		&self.shared.settings
	}

	/// Launch the process.
	///
	/// Permitted from every state but [`Running`](State::Running) and
	/// [`Stopping`](State::Stopping). A launch failure is not returned: the supervisor moves to
	/// [`StartFailed`](State::StartFailed) and the error is available from
	/// [`start_error()`](Self::start_error).
	pub fn start(&self) -> Ticket<()> {
		let shared = self.shared.clone();
		self.shared.queue.enqueue(move || shared.fire(Trigger::Start))
	}

	/// Stop the process.
	///
	/// With no timeout, or a zero one, the process is killed right away. Otherwise it is first asked
	/// to exit over its [shutdown channel](crate::shutdown), which may take up to `timeout`, and
	/// then given up to `timeout` again to actually exit; it is killed if either runs out.
	///
	/// The returned future resolves once this has played out. The request is enqueued even if the
	/// future isn't polled.
	pub fn stop(
		&self,
		timeout: Option<Duration>,
	) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
		let shared = self.shared.clone();
		let ticket = self.shared.queue.enqueue_fn(move || {
			let mut core = shared.core();
			shared.fire_locked(&mut core, Trigger::Stop(timeout));
			core.cooperative_stop.take()
		});

		async move {
			if let Some(cooperative) = ticket.await? {
				cooperative.await.map_err(|_| QueueError::Panicked)?;
			}
			Ok(())
		}
	}

	/// The current state.
	#[must_use]
	pub fn state(&self) -> State {
		*self.shared.state.borrow()
	}

	/// A receiver always holding the latest state.
	#[must_use]
	pub fn subscribe_state(&self) -> watch::Receiver<State> {
		self.shared.state.subscribe()
	}

	/// Every transition from now on.
	#[must_use]
	pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
		self.shared.changes.subscribe()
	}

	/// Standard output lines from now on.
	#[must_use]
	pub fn output(&self) -> broadcast::Receiver<String> {
		self.shared.output.subscribe()
	}

	/// Standard error lines from now on, if [captured](SupervisorSettings::capture_stderr).
	#[must_use]
	pub fn errors(&self) -> broadcast::Receiver<String> {
		self.shared.errors.subscribe()
	}

	/// The error of the last launch attempt, if it failed.
	#[must_use]
	pub fn start_error(&self) -> Option<StartError> {
		self.shared.core().start_error.clone()
	}

	/// The current or last process, if one was launched.
	#[must_use]
	pub fn process_info(&self) -> Option<ProcessInfo> {
		self.shared.core().info
	}

	/// Whether the current or last process was killed by this supervisor.
	#[must_use]
	pub fn was_killed(&self) -> bool {
		self.shared.core().killed
	}

	/// Resolves to true when the supervisor next enters `state`.
	///
	/// Only transitions happening after this is called count, so it's meant to be called before
	/// the action expected to cause the transition. Resolves to false once the supervisor is
	/// dropped, even if a stop it started is still winding down.
	pub fn when_state_is(&self, state: State) -> impl Future<Output = bool> + Send + 'static {
		let mut changes = self.state_changes();
		until_dropped(self.shared.dropped.clone(), async move {
			loop {
				match changes.recv().await {
					Ok(change) if change.to == state => return true,
					Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
					Err(broadcast::error::RecvError::Closed) => return false,
				}
			}
		})
	}

	/// Resolves to true on the first output line starting with `prefix`, from now on.
	///
	/// Resolves to false once the supervisor is dropped.
	pub fn when_output_starts_with(
		&self,
		prefix: impl Into<String>,
	) -> impl Future<Output = bool> + Send + 'static {
		let prefix = prefix.into();
		let mut output = self.output();
		until_dropped(self.shared.dropped.clone(), async move {
			loop {
				match output.recv().await {
					Ok(line) if line.starts_with(&prefix) => return true,
					Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
					Err(broadcast::error::RecvError::Closed) => return false,
				}
			}
		})
	}

	/// Render the state machine as a Graphviz DOT digraph.
	#[must_use]
	pub fn diagram(&self) -> String {
		crate::state::diagram()
	}
}

async fn until_dropped(dropped: CancellationToken, wait: impl Future<Output = bool>) -> bool {
	select! {
		biased;
		found = wait => found,
		() = dropped.cancelled() => false,
	}
}

impl Drop for ProcessSupervisor {
	fn drop(&mut self) {
		self.shared.queue.dispose();
		self.shared.dropped.cancel();
		if let Some(process) = self.shared.core().process.take() {
			debug!(parent: &self.shared.span, pid = process.pid(), "supervisor dropped, killing process");
			process.kill();
		}
	}
}

impl Shared {
	fn core(&self) -> MutexGuard<'_, Core> {
		self.core.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn fire(self: &Arc<Self>, trigger: Trigger) {
		let mut core = self.core();
		self.fire_locked(&mut core, trigger);
	}

	fn fire_locked(self: &Arc<Self>, core: &mut Core, trigger: Trigger) {
		let _span = self.span.enter();
		let from = *self.state.borrow();
		let kind = trigger.kind();
		let ctx = GuardContext {
			killed: core.killed,
			exit_code: core.info.and_then(|info| info.exit_code),
		};

		let Some(to) = next_state(from, kind, ctx) else {
			warn!(%from, trigger = %kind, "trigger not permitted in this state, ignoring");
			return;
		};

		match &trigger {
			Trigger::Start => {
				core.killed = false;
				core.start_error = None;
			}
			Trigger::StartError(err) => {
				core.process = None;
				core.info = None;
				core.start_error = Some(err.clone());
			}
			Trigger::Stop(_) | Trigger::ProcessExit => {}
		}

		self.state.send_replace(to);
		info!(%from, %to, trigger = %kind, "state transition");
		self.changes.send(StateChange { from, to }).ok();

		match trigger {
			Trigger::Start => self.launch(core),
			Trigger::Stop(timeout) => self.begin_stop(core, timeout),
			Trigger::StartError(_) | Trigger::ProcessExit => {}
		}
	}

	fn launch(self: &Arc<Self>, core: &mut Core) {
		core.process = None;
		core.info = None;

		let shared = Arc::downgrade(self);
		let spawned = ProcessHandle::spawn(
			&self.settings,
			&self.output,
			&self.errors,
			&self.span,
			move |pid, code| {
				if let Some(shared) = shared.upgrade() {
					shared.process_exited(pid, code);
				}
			},
		);

		match spawned {
			Ok(process) => {
				info!(pid = process.pid(), "process started");
				core.info = Some(ProcessInfo {
					id: process.pid(),
					exit_code: None,
				});
				core.process = Some(process);
			}
			Err(err) => {
				warn!(%err, "failed to start process");
				self.fire_locked(core, Trigger::StartError(err));
			}
		}
	}

	fn process_exited(self: &Arc<Self>, pid: u32, code: i32) {
		let shared = self.clone();
		let _ = self.queue.enqueue(move || {
			let mut core = shared.core();
			match core.info.as_mut() {
				Some(info) if info.id == pid => info.exit_code = Some(code),
				_ => {
					debug!(parent: &shared.span, pid, "exit of a replaced process, ignoring");
					return;
				}
			}
			shared.fire_locked(&mut core, Trigger::ProcessExit);
		});
	}

	fn begin_stop(self: &Arc<Self>, core: &mut Core, timeout: Option<Duration>) {
		let Some(pid) = core.process.as_ref().map(ProcessHandle::pid) else {
			return;
		};

		match timeout.filter(|timeout| !timeout.is_zero()) {
			None => {
				core.killed = true;
				if !core.process.as_ref().is_some_and(ProcessHandle::kill) {
					warn!(pid, "could not kill process, it already exited");
				}
			}
			Some(timeout) => {
				let shared = self.clone();
				core.cooperative_stop = Some(tokio::spawn(
					async move { shared.stop_cooperatively(pid, timeout).await }
						.instrument(self.span.clone()),
				));
			}
		}
	}

	async fn stop_cooperatively(self: Arc<Self>, pid: u32, limit: Duration) {
		let mut state = self.state.subscribe();
		let channel = ShutdownChannel::for_process(pid);

		debug!(%channel, ?limit, "asking process to exit");
		if timeout(limit, signal_exit(&channel)).await.is_err() {
			warn!(%channel, ?limit, "exit request timed out, killing process");
			self.escalate(pid).await;
			return;
		}

		let exited = timeout(limit, state.wait_for(|state| state.is_exited()))
			.await
			.is_ok();
		if !exited {
			warn!(pid, ?limit, "process did not exit in time, killing it");
			self.escalate(pid).await;
		} else {
			trace!(pid, "process exited cooperatively");
		}
	}

	async fn escalate(self: &Arc<Self>, pid: u32) {
		let shared = self.clone();
		let _ = self
			.queue
			.enqueue(move || {
				let mut core = shared.core();
				let stopping = *shared.state.borrow() == State::Stopping;
				let delivered = match core.process.as_ref() {
					Some(process) if stopping && process.pid() == pid => Some(process.kill()),
					_ => None,
				};

				match delivered {
					Some(delivered) => {
						core.killed = true;
						if !delivered {
							warn!(pid, "could not kill process, it already exited");
						}
					}
					None => debug!(pid, "process no longer stopping, not killing"),
				}
			})
			.await;
	}
}

#[cfg(test)]
mod tests {
	use tracing_test::traced_test;

	use super::*;

	#[tokio::test]
	#[traced_test]
	async fn stop_before_start_is_ignored() {
		let supervisor = ProcessSupervisor::new(SupervisorSettings::new(".", "/bin/true"));
		let mut changes = supervisor.state_changes();

		supervisor.stop(None).await.unwrap();

		assert_eq!(supervisor.state(), State::NotStarted);
		assert!(changes.try_recv().is_err());
		assert!(logs_contain("trigger not permitted in this state"));
	}

	#[tokio::test]
	async fn dropping_disposes_queue() {
		let supervisor = ProcessSupervisor::new(SupervisorSettings::new(".", "/bin/true"));
		let queue = supervisor.shared.queue.clone();
		drop(supervisor);

		assert!(queue.is_disposed());
		assert_eq!(queue.enqueue(|| ()).await, Err(QueueError::Cancelled));
	}

	#[cfg(unix)]
	fn sh(script: &str) -> SupervisorSettings {
		SupervisorSettings::new(".", "/bin/sh").with_args(["-c", script])
	}

	#[cfg(unix)]
	#[tokio::test]
	#[traced_test]
	async fn escalation_after_clean_exit_does_nothing() {
		let supervisor = ProcessSupervisor::new(sh("exit 0"));
		let exited = supervisor.when_state_is(State::ExitedUnexpectedly);
		supervisor.start().await.unwrap();
		assert!(timeout(Duration::from_secs(10), exited).await.unwrap());
		let pid = supervisor.process_info().unwrap().id;

		supervisor.shared.escalate(pid).await;

		assert_eq!(supervisor.state(), State::ExitedUnexpectedly);
		assert!(!supervisor.was_killed());
		assert!(logs_contain("process no longer stopping, not killing"));
	}

	#[cfg(unix)]
	#[tokio::test]
	#[traced_test]
	async fn escalation_only_kills_while_stopping() {
		let supervisor = ProcessSupervisor::new(sh("sleep 30"));
		supervisor.start().await.unwrap();
		let pid = supervisor.process_info().unwrap().id;

		supervisor.shared.escalate(pid).await;
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(supervisor.state(), State::Running);
		assert!(!supervisor.was_killed());

		let killed = supervisor.when_state_is(State::ExitedKilled);
		supervisor.stop(None).await.unwrap();
		assert!(timeout(Duration::from_secs(10), killed).await.unwrap());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn escalation_ignores_a_replaced_process() {
		let supervisor = ProcessSupervisor::new(sh("sleep 30"));
		supervisor.start().await.unwrap();
		let old = supervisor.process_info().unwrap().id;
		supervisor.stop(None).await.unwrap();
		let restarted = supervisor.when_state_is(State::Running);
		let mut state = supervisor.subscribe_state();
		assert!(state.wait_for(|state| state.is_exited()).await.is_ok());
		supervisor.start().await.unwrap();
		assert!(timeout(Duration::from_secs(10), restarted).await.unwrap());

		{
			let mut core = supervisor.shared.core();
			supervisor
				.shared
				.fire_locked(&mut core, Trigger::Stop(Some(Duration::from_secs(30))));
		}
		assert_eq!(supervisor.state(), State::Stopping);

		supervisor.shared.escalate(old).await;
		assert_eq!(supervisor.state(), State::Stopping);
		assert!(!supervisor.was_killed());
	}

	#[tokio::test]
	async fn state_watch_follows_transitions() {
		let supervisor = ProcessSupervisor::new(SupervisorSettings::new(".", "/does/not/exist"));
		let mut state = supervisor.subscribe_state();
		assert_eq!(*state.borrow_and_update(), State::NotStarted);

		supervisor.start().await.unwrap();

		assert!(state.has_changed().unwrap());
		assert_eq!(*state.borrow_and_update(), State::StartFailed);
		assert!(supervisor.diagram().contains("StartFailed -> Running"));
	}
}
