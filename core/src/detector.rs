//! Server-side change detector.
//!
//! One detector per subscription: it owns a filesystem watch on the marker
//! directory, re-stats the marker file on every raw signal, and emits a
//! transition event only when the derived mode actually changed. A fixed
//! heartbeat interval emits `alive` frames so a downstream proxy can tell a
//! silently dead connection from a quiet one.

use crate::event::{Mode, ModeEvent};

use std::{
	path::{Path, PathBuf},
	pin::pin,
	time::Duration,
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, trace};

#[derive(Error, Debug)]
pub enum DetectorError {
	#[error("Watcher error: (error: {0})")]
	Watcher(#[from] notify::Error),
}

/// One subscription's private watch and delivery state.
///
/// The watch handle is an owned resource: dropping the detector stops the
/// processing task and releases the underlying filesystem watch.
#[derive(Debug)]
pub struct Detector {
	watch_dir: PathBuf,
	watcher: RecommendedWatcher,
	events_rx: chan::Receiver<ModeEvent>,
	handle: Option<JoinHandle<()>>,
	stop_tx: chan::Sender<()>,
}

impl Detector {
	/// Starts watching `watch_dir` for changes that affect the presence of
	/// `marker_name` inside it.
	pub fn spawn(
		watch_dir: impl AsRef<Path>,
		marker_name: &str,
		heartbeat: Duration,
	) -> Result<Self, DetectorError> {
		let watch_dir = watch_dir.as_ref().to_path_buf();
		let marker_path = watch_dir.join(marker_name);

		let (raw_tx, raw_rx) = chan::unbounded();
		let (events_tx, events_rx) = chan::unbounded();
		let (stop_tx, stop_rx) = chan::bounded(1);

		let mut watcher = RecommendedWatcher::new(
			move |result| {
				if !raw_tx.is_closed() {
					// SAFETY: we are not blocking the thread as this is an unbounded channel
					if raw_tx.send_blocking(result).is_err() {
						error!("Unable to send raw watcher event to detector;");
					}
				} else {
					error!("Tried to send file system events to a closed channel;");
				}
			},
			Config::default(),
		)?;

		watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

		let handle = spawn(Self::handle_watch_events(
			marker_path,
			heartbeat,
			raw_rx,
			events_tx,
			stop_rx,
		));

		Ok(Self {
			watch_dir,
			watcher,
			events_rx,
			handle: Some(handle),
			stop_tx,
		})
	}

	/// Receives the next emitted event, or `None` once the detector stopped.
	pub async fn recv(&self) -> Option<ModeEvent> {
		self.events_rx.recv().await.ok()
	}

	/// Explicitly releases the filesystem watch and stops event delivery.
	/// Dropping the detector has the same effect.
	pub async fn stop(&mut self) {
		if let Err(e) = self.watcher.unwatch(&self.watch_dir) {
			error!(?e, "Unable to unwatch marker directory;");
		}

		let _ = self.stop_tx.send(()).await;

		if let Some(handle) = self.handle.take() {
			if let Err(e) = handle.await {
				error!(?e, "Failed to join detector task;");
			}
		}
	}

	async fn handle_watch_events(
		marker_path: PathBuf,
		heartbeat: Duration,
		raw_rx: chan::Receiver<notify::Result<notify::Event>>,
		events_tx: chan::Sender<ModeEvent>,
		stop_rx: chan::Receiver<()>,
	) {
		enum StreamMessage {
			RawEvent(notify::Result<notify::Event>),
			Heartbeat,
			Stop,
		}

		let mut mode = Mode::default();

		let mut heartbeat_interval = interval_at(Instant::now() + heartbeat, heartbeat);
		heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut msg_stream = pin!((
			raw_rx.map(StreamMessage::RawEvent),
			IntervalStream::new(heartbeat_interval).map(|_| StreamMessage::Heartbeat),
			stop_rx.map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::RawEvent(Ok(event)) => {
					trace!(?event, "Raw file system event;");

					// Raw signals may fire several times for one logical
					// change; the mode-equality check inside `apply`
					// absorbs the duplicates.
					let stat = tokio::fs::metadata(&marker_path).await;
					if let Some(transition) = mode.apply(&stat) {
						debug!(event = %transition, "Marker mode transition;");
						if events_tx.send(transition).await.is_err() {
							break;
						}
					}
				}

				StreamMessage::RawEvent(Err(e)) => error!(?e, "Watcher error;"),

				StreamMessage::Heartbeat => {
					if events_tx.send(ModeEvent::Alive).await.is_err() {
						break;
					}
				}

				StreamMessage::Stop => {
					trace!("Detector received stop signal and will exit...");
					break;
				}
			}
		}
	}
}

impl Drop for Detector {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			let stop_tx = self.stop_tx.clone();
			spawn(async move {
				// The task may already be gone if the event channel closed first.
				let _ = stop_tx.send(()).await;

				if let Err(e) = handle.await {
					error!(?e, "Failed to join detector task;");
				}
			});
		}
	}
}
