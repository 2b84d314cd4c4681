//! The supervisor's state machine, as data.
//!
//! Transitions are an explicit table of `(from, trigger, guard, to)` rows, interpreted by
//! [`next_state()`]. Guards are plain conditions over the killed flag and the exit code.

use std::fmt::{self, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::StartError;

/// The lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
	/// Nothing was started yet.
	#[default]
	NotStarted,

	/// The process was launched and has not exited.
	Running,

	/// The process could not be launched.
	StartFailed,

	/// A stop was requested and the process has not exited yet.
	Stopping,

	/// The process exited with code zero after a stop request, without being killed.
	ExitedSuccessfully,

	/// The process exited with a non-zero code after a stop request, without being killed.
	ExitedWithError,

	/// The process exited without being asked to.
	ExitedUnexpectedly,

	/// The process was killed as part of a stop.
	ExitedKilled,
}

impl State {
	/// All states, in declaration order.
	pub const ALL: [Self; 8] = [
		Self::NotStarted,
		Self::Running,
		Self::StartFailed,
		Self::Stopping,
		Self::ExitedSuccessfully,
		Self::ExitedWithError,
		Self::ExitedUnexpectedly,
		Self::ExitedKilled,
	];

	/// Whether this is one of the `Exited*` states.
	#[must_use]
	pub const fn is_exited(self) -> bool {
		matches!(
			self,
			Self::ExitedSuccessfully
				| Self::ExitedWithError
				| Self::ExitedUnexpectedly
				| Self::ExitedKilled
		)
	}

	/// Whether only a new start can leave this state.
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		self.is_exited() || matches!(self, Self::StartFailed)
	}
}

impl fmt::Display for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// The kind of a [`Trigger`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
	/// Launch the process.
	Start,

	/// Launching failed.
	StartError,

	/// Stop the process.
	Stop,

	/// The OS reported the process exited.
	ProcessExit,
}

impl fmt::Display for TriggerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// An event driving the state machine.
#[derive(Debug, Clone)]
pub enum Trigger {
	/// Launch the process.
	Start,

	/// Launching failed with this error.
	StartError(StartError),

	/// Stop the process, cooperatively first if a non-zero timeout is given.
	Stop(Option<std::time::Duration>),

	/// The OS reported the process exited.
	ProcessExit,
}

impl Trigger {
	/// The payload-less kind of this trigger.
	#[must_use]
	pub const fn kind(&self) -> TriggerKind {
		match self {
			Self::Start => TriggerKind::Start,
			Self::StartError(_) => TriggerKind::StartError,
			Self::Stop(_) => TriggerKind::Stop,
			Self::ProcessExit => TriggerKind::ProcessExit,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
	Always,
	Exited,
	CleanExit,
	ErrorExit,
	Killed,
}

impl Guard {
	const fn holds(self, ctx: GuardContext) -> bool {
		match self {
			Self::Always => true,
			Self::Exited => ctx.exit_code.is_some(),
			Self::CleanExit => !ctx.killed && matches!(ctx.exit_code, Some(0)),
			Self::ErrorExit => !ctx.killed && !matches!(ctx.exit_code, Some(0)),
			Self::Killed => ctx.killed,
		}
	}

	const fn label(self) -> Option<&'static str> {
		match self {
			Self::Always | Self::Exited => None,
			Self::CleanExit => Some("!killed && code == 0"),
			Self::ErrorExit => Some("!killed && code != 0"),
			Self::Killed => Some("killed"),
		}
	}
}

/// What guards are evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardContext {
	/// Whether the process was killed by the supervisor.
	pub killed: bool,

	/// The process's exit code, if it has exited.
	pub exit_code: Option<i32>,
}

const TRANSITIONS: &[(State, TriggerKind, Guard, State)] = &[
	(State::NotStarted, TriggerKind::Start, Guard::Always, State::Running),
	(State::Running, TriggerKind::StartError, Guard::Always, State::StartFailed),
	(State::Running, TriggerKind::Stop, Guard::Always, State::Stopping),
	(State::Running, TriggerKind::ProcessExit, Guard::Exited, State::ExitedUnexpectedly),
	(State::Stopping, TriggerKind::ProcessExit, Guard::CleanExit, State::ExitedSuccessfully),
	(State::Stopping, TriggerKind::ProcessExit, Guard::ErrorExit, State::ExitedWithError),
	(State::Stopping, TriggerKind::ProcessExit, Guard::Killed, State::ExitedKilled),
	(State::StartFailed, TriggerKind::Start, Guard::Always, State::Running),
	(State::ExitedSuccessfully, TriggerKind::Start, Guard::Always, State::Running),
	(State::ExitedWithError, TriggerKind::Start, Guard::Always, State::Running),
	(State::ExitedUnexpectedly, TriggerKind::Start, Guard::Always, State::Running),
	(State::ExitedKilled, TriggerKind::Start, Guard::Always, State::Running),
];

/// The state `from` moves to on `trigger`, or `None` if the trigger isn't permitted there.
#[must_use]
pub fn next_state(from: State, trigger: TriggerKind, ctx: GuardContext) -> Option<State> {
	TRANSITIONS
		.iter()
		.find(|(f, t, guard, _)| *f == from && *t == trigger && guard.holds(ctx))
		.map(|(_, _, _, to)| *to)
}

/// The triggers which have at least one row leaving `from`.
#[must_use]
pub fn permitted_triggers(from: State) -> Vec<TriggerKind> {
	let mut triggers = Vec::new();
	for (f, t, _, _) in TRANSITIONS {
		if *f == from && !triggers.contains(t) {
			triggers.push(*t);
		}
	}
	triggers
}

/// Render the state machine as a Graphviz DOT digraph.
#[must_use]
pub fn diagram() -> String {
	let mut dot = String::from("digraph {\n\tcompound=true;\n\tnode [shape=Mrecord]\n\trankdir=\"LR\"\n\n");
	for state in State::ALL {
		writeln!(dot, "\t{state} [label=\"{state}\"];").ok();
	}
	dot.push('\n');
	for (from, trigger, guard, to) in TRANSITIONS {
		let label = guard
			.label()
			.map_or_else(|| trigger.to_string(), |g| format!("{trigger} [{g}]"));
		writeln!(dot, "\t{from} -> {to} [label=\"{label}\"];").ok();
	}
	writeln!(dot, "\tinit [label=\"\", shape=point];\n\tinit -> {};", State::NotStarted).ok();
	dot.push_str("}\n");
	dot
}
