//! Upstream transport seam.
//!
//! The driver only sees the [`Upstream`] trait: something that can open a
//! stream of decoded frames and answer the one-shot maintenance-flag check.
//! Production uses [`HttpUpstream`] over a reqwest byte stream; tests swap
//! in channel-backed mocks.

use crate::event::ModeEvent;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{
	future::ready,
	stream::{self, Stream, StreamExt},
};
use reqwest::header;
use thiserror::Error;
use tracing::debug;

use super::flag::{self, FlagStatus};

#[derive(Error, Debug)]
pub enum TransportError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("Upstream closed the stream")]
	Closed,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ModeEvent, TransportError>> + Send>>;

#[async_trait]
pub trait Upstream: Send + Sync + 'static {
	/// Opens a fresh stream of decoded frames. An error here means the
	/// attempt itself failed (refused connection, non-2xx response).
	async fn open(&self) -> Result<FrameStream, TransportError>;

	/// One-shot maintenance-flag check against the same origin, used to
	/// resync consumers after a reconnect gap.
	async fn check_flag(&self) -> FlagStatus;
}

/// Incremental decoder for the `data:<payload>` frames of an event stream.
///
/// Only `data:` fields matter here; other fields and comment lines are
/// skipped. The optional space after the colon is tolerated.
#[derive(Debug, Default)]
pub struct SseDecoder {
	buf: String,
}

impl SseDecoder {
	/// Feeds one chunk of bytes, returning every complete `data:` payload
	/// it finished.
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
		self.buf.push_str(&String::from_utf8_lossy(chunk));

		let mut payloads = Vec::new();
		while let Some(newline) = self.buf.find('\n') {
			let line = self.buf[..newline].trim_end_matches('\r').to_string();
			self.buf.drain(..=newline);

			if let Some(value) = line.strip_prefix("data:") {
				payloads.push(value.strip_prefix(' ').unwrap_or(value).to_string());
			}
		}

		payloads
	}
}

/// The real upstream: a persistent `GET /events` plus the proxied flag GET.
pub struct HttpUpstream {
	client: reqwest::Client,
	events_url: String,
	flag_url: String,
}

impl HttpUpstream {
	pub fn new(base_url: &str, marker_name: &str) -> Self {
		let base = base_url.trim_end_matches('/');

		// Without a connect bound a half-open server would leave the open
		// attempt hanging; no total request timeout though, the events
		// response body is a long-lived stream.
		let client = reqwest::Client::builder()
			.connect_timeout(crate::DEFAULT_OPEN_TIMEOUT)
			.build()
			.expect("failed to build HTTP client");

		Self {
			client,
			events_url: format!("{base}/events"),
			flag_url: format!("{base}/static/{marker_name}"),
		}
	}
}

#[async_trait]
impl Upstream for HttpUpstream {
	async fn open(&self) -> Result<FrameStream, TransportError> {
		let response = self
			.client
			.get(&self.events_url)
			.header(header::ACCEPT, "text/event-stream")
			.send()
			.await?
			.error_for_status()?;

		let frames = response
			.bytes_stream()
			.scan(SseDecoder::default(), |decoder, chunk| {
				ready(Some(match chunk {
					Ok(bytes) => decoder
						.feed(&bytes)
						.into_iter()
						.map(Ok)
						.collect::<Vec<_>>(),
					Err(e) => vec![Err(TransportError::Http(e))],
				}))
			})
			.flat_map(stream::iter)
			.filter_map(|item| {
				ready(match item {
					Ok(token) => match ModeEvent::from_token(&token) {
						Some(event) => Some(Ok(event)),
						None => {
							debug!(%token, "Ignoring unknown stream token;");
							None
						}
					},
					Err(e) => Some(Err(e)),
				})
			})
			// A cleanly ended stream is still a lost connection.
			.chain(stream::once(ready(Err(TransportError::Closed))));

		Ok(Box::pin(frames))
	}

	async fn check_flag(&self) -> FlagStatus {
		flag::check_flag(&self.client, &self.flag_url).await
	}
}
