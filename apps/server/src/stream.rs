//! The `/events` stream endpoint.
//!
//! Every connected client gets its own change detector, and with it its own
//! filesystem watch: teardown accounting stays trivial because dropping the
//! response stream drops the detector, which releases the watch. The
//! detector's own `alive` frames double as the stream keep-alive.

use std::{convert::Infallible, net::SocketAddr};

use axum::{
	extract::{ConnectInfo, State},
	response::sse::{Event, Sse},
};
use futures::{stream, Stream, StreamExt};
use sema_core::{Detector, ModeEvent};
use tracing::{error, info};

use crate::AppState;

pub async fn events(
	State(state): State<AppState>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	info!(%peer, "Stream subscriber connected");

	let stream = match Detector::spawn(&state.static_dir, &state.marker, state.heartbeat) {
		Ok(detector) => stream::unfold(Subscription { detector, peer }, |sub| async move {
			let event = sub.detector.recv().await?;
			Some((Ok(to_frame(event)), sub))
		})
		.left_stream(),

		Err(e) => {
			error!(error = %e, %peer, "Failed to start change detector for subscriber;");
			stream::empty().right_stream()
		}
	};

	Sse::new(stream)
}

/// Owns the detector for the life of one subscription.
struct Subscription {
	detector: Detector,
	peer: SocketAddr,
}

impl Drop for Subscription {
	fn drop(&mut self) {
		info!(peer = %self.peer, "Stream subscriber disconnected");
	}
}

fn to_frame(event: ModeEvent) -> Event {
	Event::default().data(event.as_str())
}
