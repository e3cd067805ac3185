//! Local consumer connections.
//!
//! One TCP connection per consumer, line-delimited in both directions:
//! lines read from the consumer are control tokens, and every broadcast
//! token is written back out as a line. Attaching asks the proxy to make
//! sure the upstream exists; detaching asks it to re-evaluate whether the
//! upstream is still needed.

use std::net::SocketAddr;

use sema_core::{proxy::ControlMessage, registry::ChannelRegistry};
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	net::TcpStream,
	sync::mpsc,
};
use tracing::{debug, info};

pub async fn serve(
	stream: TcpStream,
	peer: SocketAddr,
	registry: ChannelRegistry,
	control_tx: mpsc::UnboundedSender<ControlMessage>,
) {
	let (reader, mut writer) = stream.into_split();
	let mut broadcasts = registry.attach();

	info!(%peer, "Consumer attached");
	let _ = control_tx.send(ControlMessage::EnsureConnected);

	let mut lines = BufReader::new(reader).lines();

	loop {
		tokio::select! {
			maybe_line = lines.next_line() => match maybe_line {
				Ok(Some(line)) => match ControlMessage::from_token(line.trim()) {
					Some(message) => {
						let _ = control_tx.send(message);
					}
					None => debug!(%peer, %line, "Ignoring unknown control message"),
				},
				Ok(None) | Err(_) => break,
			},

			maybe_message = broadcasts.recv() => match maybe_message {
				Some(message) => {
					if writer.write_all(format!("{message}\n").as_bytes()).await.is_err() {
						break;
					}
				}
				// Registry went away; the proxy is shutting down.
				None => break,
			},
		}
	}

	// Detach before the close evaluation so this consumer no longer counts.
	drop(broadcasts);
	info!(%peer, "Consumer detached");
	let _ = control_tx.send(ControlMessage::EvaluateIdleClose);
}
