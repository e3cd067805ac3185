use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use sema_core::{
	proxy::{ControlMessage, HttpUpstream, Proxy, ProxyConfig},
	registry::ChannelRegistry,
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod consumers;

/// Client-side connection proxy: holds the single upstream stream
/// connection to the relay server and multiplexes it to every local
/// consumer, reconnecting on its own when the stream dies.
#[derive(Debug, Parser)]
#[command(name = "sema-proxy")]
struct Args {
	/// Base URL of the relay server.
	#[arg(long, env = "SEMA_SERVER_URL", default_value = "http://localhost:3000")]
	server_url: String,

	/// Marker file name, used for the proxied maintenance-flag check.
	#[arg(long, env = "SEMA_MARKER", default_value = "isUnderMaintenance.json")]
	marker: String,

	/// Local address consumers connect to.
	#[arg(long, env = "SEMA_PROXY_LISTEN", default_value = "127.0.0.1:3100")]
	listen: SocketAddr,

	/// Forced-reconnect deadline when no heartbeat arrives, in seconds.
	#[arg(long, env = "SEMA_WATCHDOG_SECS", default_value_t = 20)]
	watchdog_secs: u64,

	/// Delay before retrying after a transport error, in milliseconds.
	#[arg(long, env = "SEMA_RETRY_DELAY_MS", default_value_t = 200)]
	retry_delay_ms: u64,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			EnvFilter::new("info,sema_proxy=debug,sema_core=debug")
		}))
		.init();

	let args = Args::parse();

	let registry = ChannelRegistry::new();
	let (control_tx, control_rx) = mpsc::unbounded_channel();

	let proxy = Proxy::new(
		HttpUpstream::new(&args.server_url, &args.marker),
		registry.clone(),
		ProxyConfig {
			watchdog: Duration::from_secs(args.watchdog_secs),
			retry_delay: Duration::from_millis(args.retry_delay_ms),
			..ProxyConfig::default()
		},
		control_rx,
	);
	tokio::spawn(proxy.run());

	// Connect upstream right away rather than waiting for the first
	// consumer, so early attachers find a live relay behind them. Their
	// own connect requests are deduplicated by the driver anyway.
	control_tx
		.send(ControlMessage::EnsureConnected)
		.expect("proxy driver exited before startup finished");

	let listener = TcpListener::bind(args.listen)
		.await
		.expect("Error binding consumer listener!");
	info!(upstream = %args.server_url, "Accepting consumers on {}", args.listen);

	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				tokio::spawn(consumers::serve(
					stream,
					peer,
					registry.clone(),
					control_tx.clone(),
				));
			}
			Err(e) => error!(error = %e, "Failed to accept consumer connection;"),
		}
	}
}
