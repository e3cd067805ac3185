//! The upstream-connection state machine.
//!
//! All of the reconnect logic lives here as pure transitions over one owned
//! state struct, so it can be exercised without a network layer. The driver
//! in [`super`] feeds inputs and carries out the returned effects in order.

use crate::event::ModeEvent;

/// Lifecycle of the single upstream connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnState {
	/// No connection exists and none is being established.
	#[default]
	Absent,
	/// An open attempt is in flight.
	Connecting,
	/// The stream is open and delivering frames.
	Open,
	/// The transport reported an error; a fast retry is pending.
	ErrorPendingReconnect,
}

/// Inputs fed to the machine by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
	/// A consumer sent `check-event-source-connected`.
	ControlConnect,
	/// A consumer sent `check-event-source-closable`; carries the number of
	/// consumers attached at evaluation time.
	ControlCloseEval { consumers: usize },
	/// A fresh upstream stream was successfully opened.
	Opened,
	/// A decoded frame arrived on the open stream.
	Frame(ModeEvent),
	/// The transport reported an error, the stream ended, or an open
	/// attempt failed.
	TransportError,
	/// The fast-retry delay elapsed.
	RetryDue,
	/// The watchdog deadline passed without a heartbeat.
	WatchdogFired,
}

/// Side effects for the driver to carry out, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
	OpenUpstream,
	CloseUpstream,
	ArmWatchdog,
	DisarmWatchdog,
	ScheduleRetry,
	Broadcast(ModeEvent),
	/// Re-fetch the maintenance flag so consumers converge after a
	/// reconnect gap instead of waiting for the next transition.
	Resync,
}

/// The one proxy-wide state struct. Exactly one instance exists for the
/// lifetime of the proxy process and only [`step`] mutates it.
#[derive(Debug, Default)]
pub struct ProxyMachine {
	pub conn: ConnState,
	/// True only while a deliberate idle close is in effect. Distinguishes
	/// "intentionally down" from "down and needs reconnect": no reconnect
	/// path fires until a consumer explicitly asks to connect again.
	pub closed: bool,
	/// Guard shared by the transport-error fast path and the watchdog so
	/// the two never schedule concurrent reconnect attempts.
	pub retry_scheduled: bool,
}

pub fn step(state: &mut ProxyMachine, input: Input) -> Vec<Effect> {
	match input {
		Input::ControlConnect => match state.conn {
			// Idempotent: already connected or connecting is a no-op.
			ConnState::Connecting | ConnState::Open => Vec::new(),
			ConnState::Absent | ConnState::ErrorPendingReconnect => {
				state.conn = ConnState::Connecting;
				state.closed = false;
				vec![Effect::OpenUpstream]
			}
		},

		Input::ControlCloseEval { consumers } => {
			// Advisory cleanup: only close when nobody is listening.
			if consumers == 0 && state.conn != ConnState::Absent {
				state.conn = ConnState::Absent;
				state.closed = true;
				state.retry_scheduled = false;
				vec![Effect::DisarmWatchdog, Effect::CloseUpstream]
			} else {
				Vec::new()
			}
		}

		Input::Opened => {
			state.conn = ConnState::Open;
			state.closed = false;
			state.retry_scheduled = false;
			vec![Effect::ArmWatchdog, Effect::Resync]
		}

		// Heartbeats are the only frames that rearm the watchdog.
		Input::Frame(ModeEvent::Alive) => vec![Effect::ArmWatchdog],

		// Data events pass through verbatim; the server already
		// deduplicated them.
		Input::Frame(event) => vec![Effect::Broadcast(event)],

		Input::TransportError => {
			if state.closed {
				return Vec::new();
			}
			state.conn = ConnState::ErrorPendingReconnect;
			if state.retry_scheduled {
				// A retry is already pending; it will pick this up.
				return Vec::new();
			}
			state.retry_scheduled = true;
			vec![Effect::DisarmWatchdog, Effect::ScheduleRetry]
		}

		Input::RetryDue => {
			state.retry_scheduled = false;
			// A deliberate close or an intervening connect request makes
			// this retry stale.
			if state.closed || state.conn != ConnState::ErrorPendingReconnect {
				return Vec::new();
			}
			state.conn = ConnState::Connecting;
			vec![Effect::OpenUpstream]
		}

		Input::WatchdogFired => {
			if state.closed || state.conn != ConnState::Open {
				return Vec::new();
			}
			// Silent stall: the transport raised no error, but no
			// heartbeat arrived in time either.
			state.conn = ConnState::Connecting;
			vec![Effect::CloseUpstream, Effect::OpenUpstream]
		}
	}
}
