//! Client-side connection proxy.
//!
//! One proxy instance per process owns at most one upstream stream
//! connection and multiplexes it to every attached consumer. The reconnect
//! protocol lives in the pure [`machine`]; this module is the driver that
//! wires it to real timers, the upstream transport, and the consumer
//! registry. Loss of the upstream is never fatal here: it is retried either
//! fast (explicit transport error) or after the watchdog interval (silent
//! stall), unless a deliberate idle close is in effect.

use crate::{event::ModeEvent, registry::ConsumerRegistry};

use std::{collections::VecDeque, future, time::Duration};

use futures::StreamExt;
use tokio::{
	sync::mpsc,
	time::{self, Instant},
};
use tracing::{debug, trace, warn};

pub mod flag;
pub mod machine;
pub mod transport;

pub use flag::FlagStatus;
pub use machine::{step, ConnState, Effect, Input, ProxyMachine};
pub use transport::{FrameStream, HttpUpstream, TransportError, Upstream};

/// Control requests consumers may send to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
	/// Make sure an upstream connection exists.
	EnsureConnected,
	/// Close the upstream if no consumer needs it anymore.
	EvaluateIdleClose,
}

impl ControlMessage {
	pub const CONNECT_TOKEN: &'static str = "check-event-source-connected";
	pub const CLOSABLE_TOKEN: &'static str = "check-event-source-closable";

	pub fn from_token(token: &str) -> Option<Self> {
		match token {
			Self::CONNECT_TOKEN => Some(Self::EnsureConnected),
			Self::CLOSABLE_TOKEN => Some(Self::EvaluateIdleClose),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
	/// Forced-reconnect deadline when no heartbeat arrives.
	pub watchdog: Duration,
	/// Delay before retrying after an explicit transport error.
	pub retry_delay: Duration,
	/// Upper bound on one open attempt (and one flag resync). A connect
	/// that never completes must not wedge the driver loop.
	pub open_timeout: Duration,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			watchdog: crate::DEFAULT_WATCHDOG,
			retry_delay: crate::DEFAULT_RETRY_DELAY,
			open_timeout: crate::DEFAULT_OPEN_TIMEOUT,
		}
	}
}

/// Single-slot timer. Arming always replaces any previously armed
/// deadline; a disarmed slot never fires. One instance is the heartbeat
/// dead-man's-switch, another the fast-retry delay.
#[derive(Debug, Default)]
struct SingleSlotTimer {
	deadline: Option<Instant>,
}

impl SingleSlotTimer {
	fn arm(&mut self, interval: Duration) {
		self.deadline = Some(Instant::now() + interval);
	}

	fn disarm(&mut self) {
		self.deadline = None;
	}

	async fn expired(&self) {
		match self.deadline {
			Some(deadline) => time::sleep_until(deadline).await,
			None => future::pending().await,
		}
	}
}

/// The driver. Owns the upstream connection exclusively; consumers only
/// ever reach it through control messages.
pub struct Proxy<U, R> {
	upstream: U,
	registry: R,
	config: ProxyConfig,
	machine: ProxyMachine,
	control_rx: mpsc::UnboundedReceiver<ControlMessage>,
	conn: Option<FrameStream>,
	watchdog: SingleSlotTimer,
	retry: SingleSlotTimer,
}

impl<U: Upstream, R: ConsumerRegistry> Proxy<U, R> {
	pub fn new(
		upstream: U,
		registry: R,
		config: ProxyConfig,
		control_rx: mpsc::UnboundedReceiver<ControlMessage>,
	) -> Self {
		Self {
			upstream,
			registry,
			config,
			machine: ProxyMachine::default(),
			control_rx,
			conn: None,
			watchdog: SingleSlotTimer::default(),
			retry: SingleSlotTimer::default(),
		}
	}

	/// Drives the proxy until every control-channel sender is dropped.
	pub async fn run(mut self) {
		enum Wake {
			Control(Option<ControlMessage>),
			Frame(Option<Result<ModeEvent, TransportError>>),
			Watchdog,
			Retry,
		}

		loop {
			let wake = {
				let conn = &mut self.conn;
				let frame = async move {
					match conn {
						Some(stream) => stream.next().await,
						None => future::pending().await,
					}
				};

				tokio::select! {
					maybe_msg = self.control_rx.recv() => Wake::Control(maybe_msg),
					item = frame => Wake::Frame(item),
					() = self.watchdog.expired() => Wake::Watchdog,
					() = self.retry.expired() => Wake::Retry,
				}
			};

			match wake {
				Wake::Control(None) => {
					debug!("All control senders dropped, proxy exiting");
					break;
				}

				Wake::Control(Some(ControlMessage::EnsureConnected)) => {
					self.apply(Input::ControlConnect).await;
				}

				Wake::Control(Some(ControlMessage::EvaluateIdleClose)) => {
					let consumers = self.registry.attached_count();
					trace!(consumers, "Evaluating idle close;");
					self.apply(Input::ControlCloseEval { consumers }).await;
				}

				Wake::Frame(Some(Ok(event))) => {
					trace!(%event, "Upstream frame;");
					self.apply(Input::Frame(event)).await;
				}

				Wake::Frame(Some(Err(e))) => {
					warn!(error = %e, "Upstream transport error;");
					self.conn = None;
					self.apply(Input::TransportError).await;
				}

				Wake::Frame(None) => {
					warn!("Upstream stream ended;");
					self.conn = None;
					self.apply(Input::TransportError).await;
				}

				Wake::Watchdog => {
					warn!("No heartbeat within watchdog interval, forcing reconnect;");
					self.watchdog.disarm();
					self.apply(Input::WatchdogFired).await;
				}

				Wake::Retry => {
					self.retry.disarm();
					self.apply(Input::RetryDue).await;
				}
			}
		}
	}

	/// Feeds one input through the machine and carries out the effects.
	/// Effects may produce follow-up inputs (an open attempt resolves to
	/// `Opened` or `TransportError`), hence the queue.
	async fn apply(&mut self, input: Input) {
		let mut queue = VecDeque::from([input]);

		while let Some(input) = queue.pop_front() {
			for effect in machine::step(&mut self.machine, input) {
				match effect {
					Effect::OpenUpstream => {
						match time::timeout(self.config.open_timeout, self.upstream.open()).await {
							Ok(Ok(stream)) => {
								debug!("Upstream connection opened");
								self.conn = Some(stream);
								queue.push_back(Input::Opened);
							}
							Ok(Err(e)) => {
								warn!(error = %e, "Failed to open upstream connection;");
								queue.push_back(Input::TransportError);
							}
							Err(_) => {
								warn!(
									timeout = ?self.config.open_timeout,
									"Upstream open attempt timed out;"
								);
								queue.push_back(Input::TransportError);
							}
						}
					}

					Effect::CloseUpstream => {
						debug!("Closing upstream connection");
						self.conn = None;
					}

					Effect::ArmWatchdog => self.watchdog.arm(self.config.watchdog),

					Effect::DisarmWatchdog => self.watchdog.disarm(),

					Effect::ScheduleRetry => self.retry.arm(self.config.retry_delay),

					Effect::Broadcast(event) => self.registry.broadcast(event.as_str()),

					Effect::Resync => {
						let status =
							time::timeout(self.config.open_timeout, self.upstream.check_flag())
								.await
								.unwrap_or_else(|_| {
									warn!("Maintenance flag resync timed out;");
									FlagStatus::Unknown
								});

						match status {
							FlagStatus::Maintenance => {
								self.registry.broadcast(ModeEvent::FilePresent.as_str());
							}
							FlagStatus::Operational => {
								self.registry.broadcast(ModeEvent::FileAbsent.as_str());
							}
							FlagStatus::Unknown => {
								debug!("Flag resync inconclusive, waiting for stream events");
							}
						}
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	};

	use async_trait::async_trait;
	use tokio_stream::wrappers::UnboundedReceiverStream;

	/// Hands out one channel-backed stream per `open` call and remembers
	/// the senders so tests can feed frames or count sessions. With
	/// `stall_opens` set, `open` never resolves, like a half-open TCP
	/// connection where the server accepts but never responds.
	struct MockUpstream {
		sessions: Mutex<Vec<mpsc::UnboundedSender<Result<ModeEvent, TransportError>>>>,
		flag: Mutex<FlagStatus>,
		stall_opens: AtomicBool,
		open_calls: AtomicUsize,
	}

	impl Default for MockUpstream {
		fn default() -> Self {
			Self {
				sessions: Mutex::default(),
				flag: Mutex::new(FlagStatus::Unknown),
				stall_opens: AtomicBool::new(false),
				open_calls: AtomicUsize::new(0),
			}
		}
	}

	impl MockUpstream {
		fn session_count(&self) -> usize {
			self.sessions.lock().unwrap().len()
		}

		fn feed(&self, item: Result<ModeEvent, TransportError>) {
			self.sessions
				.lock()
				.unwrap()
				.last()
				.expect("no open session")
				.send(item)
				.expect("session receiver dropped");
		}
	}

	#[async_trait]
	impl Upstream for Arc<MockUpstream> {
		async fn open(&self) -> Result<FrameStream, TransportError> {
			self.open_calls.fetch_add(1, Ordering::SeqCst);
			if self.stall_opens.load(Ordering::SeqCst) {
				future::pending::<()>().await;
			}

			let (tx, rx) = mpsc::unbounded_channel();
			self.sessions.lock().unwrap().push(tx);
			Ok(Box::pin(UnboundedReceiverStream::new(rx)))
		}

		async fn check_flag(&self) -> FlagStatus {
			*self.flag.lock().unwrap()
		}
	}

	#[derive(Default, Clone)]
	struct TestRegistry {
		attached: Arc<AtomicUsize>,
		messages: Arc<Mutex<Vec<String>>>,
	}

	impl ConsumerRegistry for TestRegistry {
		fn attached_count(&self) -> usize {
			self.attached.load(Ordering::SeqCst)
		}

		fn broadcast(&self, message: &str) {
			self.messages.lock().unwrap().push(message.to_string());
		}
	}

	struct Harness {
		upstream: Arc<MockUpstream>,
		registry: TestRegistry,
		control_tx: mpsc::UnboundedSender<ControlMessage>,
		handle: tokio::task::JoinHandle<()>,
	}

	fn start_proxy() -> Harness {
		let upstream = Arc::new(MockUpstream::default());
		let registry = TestRegistry::default();
		registry.attached.store(1, Ordering::SeqCst);

		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let proxy = Proxy::new(
			upstream.clone(),
			registry.clone(),
			ProxyConfig::default(),
			control_rx,
		);
		let handle = tokio::spawn(proxy.run());

		Harness {
			upstream,
			registry,
			control_tx,
			handle,
		}
	}

	/// Lets the spawned proxy task process everything currently pending.
	async fn settle() {
		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(start_paused = true)]
	async fn connects_once_for_repeated_connect_requests() {
		let h = start_proxy();

		for _ in 0..3 {
			h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		}
		settle().await;

		assert_eq!(h.upstream.session_count(), 1);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn silent_stall_forces_exactly_one_reconnect_within_watchdog() {
		let h = start_proxy();
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		// A heartbeat arms the watchdog; staying just under the interval
		// must not reconnect.
		h.upstream.feed(Ok(ModeEvent::Alive));
		settle().await;
		time::advance(Duration::from_secs(19)).await;
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		// Another heartbeat rearms it, then silence past the deadline.
		h.upstream.feed(Ok(ModeEvent::Alive));
		settle().await;
		time::advance(Duration::from_secs(21)).await;
		settle().await;
		assert_eq!(h.upstream.session_count(), 2);

		// One forced reconnect, not a storm: the fresh connection is armed
		// and quiet heartbeats keep it alive.
		h.upstream.feed(Ok(ModeEvent::Alive));
		settle().await;
		time::advance(Duration::from_secs(5)).await;
		settle().await;
		assert_eq!(h.upstream.session_count(), 2);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn transport_error_retries_after_fast_delay() {
		let h = start_proxy();
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		h.upstream.feed(Err(TransportError::Closed));
		settle().await;
		// Not yet: the fast retry waits out its delay.
		assert_eq!(h.upstream.session_count(), 1);

		time::advance(Duration::from_millis(250)).await;
		settle().await;
		assert_eq!(h.upstream.session_count(), 2);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn stalled_open_attempt_gives_up_and_retries() {
		let h = start_proxy();
		h.upstream.stall_opens.store(true, Ordering::SeqCst);

		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.open_calls.load(Ordering::SeqCst), 1);
		assert_eq!(h.upstream.session_count(), 0);

		// The open bound abandons the attempt and arms the fast retry.
		time::advance(crate::DEFAULT_OPEN_TIMEOUT + Duration::from_millis(50)).await;
		settle().await;
		assert_eq!(h.upstream.open_calls.load(Ordering::SeqCst), 1);

		// Once the retry delay elapses a fresh attempt starts instead of
		// the driver hanging on the first one forever.
		time::advance(Duration::from_millis(300)).await;
		settle().await;
		assert_eq!(h.upstream.open_calls.load(Ordering::SeqCst), 2);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn control_messages_survive_a_stalled_open_attempt() {
		let h = start_proxy();
		h.upstream.stall_opens.store(true, Ordering::SeqCst);

		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.open_calls.load(Ordering::SeqCst), 1);

		// The last consumer detaches while the open attempt is hanging.
		h.registry.attached.store(0, Ordering::SeqCst);
		h.control_tx.send(ControlMessage::EvaluateIdleClose).unwrap();

		// Just past the open bound the attempt is abandoned and the queued
		// close gets processed before the fast retry comes due.
		time::advance(crate::DEFAULT_OPEN_TIMEOUT + Duration::from_millis(100)).await;
		settle().await;

		// Deliberately closed now: no more attempts, no matter how long.
		time::advance(Duration::from_secs(3600)).await;
		settle().await;
		assert_eq!(h.upstream.open_calls.load(Ordering::SeqCst), 1);

		// And a healthy upstream reconnects on the next explicit request.
		h.upstream.stall_opens.store(false, Ordering::SeqCst);
		h.registry.attached.store(1, Ordering::SeqCst);
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn idle_close_sticks_until_explicit_reconnect() {
		let h = start_proxy();
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		// Last consumer detached.
		h.registry.attached.store(0, Ordering::SeqCst);
		h.control_tx.send(ControlMessage::EvaluateIdleClose).unwrap();
		settle().await;

		// No reconnect attempt while deliberately closed, watchdog or not.
		time::advance(Duration::from_secs(60)).await;
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		// A new consumer attaches and asks to connect.
		h.registry.attached.store(1, Ordering::SeqCst);
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;
		assert_eq!(h.upstream.session_count(), 2);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn idle_close_is_noop_while_consumers_remain() {
		let h = start_proxy();
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;

		h.control_tx.send(ControlMessage::EvaluateIdleClose).unwrap();
		settle().await;

		// Connection survived; a heartbeat still lands on it.
		h.upstream.feed(Ok(ModeEvent::Alive));
		settle().await;
		assert_eq!(h.upstream.session_count(), 1);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn data_frames_broadcast_verbatim() {
		let h = start_proxy();
		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;

		h.upstream.feed(Ok(ModeEvent::FilePresent));
		h.upstream.feed(Ok(ModeEvent::FileAbsent));
		settle().await;

		assert_eq!(
			*h.registry.messages.lock().unwrap(),
			vec!["file-present".to_string(), "file-absent".to_string()]
		);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn resync_broadcasts_current_flag_on_open() {
		let h = start_proxy();
		*h.upstream.flag.lock().unwrap() = FlagStatus::Maintenance;

		h.control_tx.send(ControlMessage::EnsureConnected).unwrap();
		settle().await;

		assert_eq!(
			*h.registry.messages.lock().unwrap(),
			vec!["file-present".to_string()]
		);

		drop(h.control_tx);
		h.handle.await.unwrap();
	}

	#[test]
	fn control_tokens_parse() {
		assert_eq!(
			ControlMessage::from_token("check-event-source-connected"),
			Some(ControlMessage::EnsureConnected)
		);
		assert_eq!(
			ControlMessage::from_token("check-event-source-closable"),
			Some(ControlMessage::EvaluateIdleClose)
		);
		assert_eq!(ControlMessage::from_token("file-present"), None);
	}
}
