use std::{net::SocketAddr, path::PathBuf, time::Duration};

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod stream;

/// Change-notification relay server: streams marker-file mode transitions
/// to subscribers and serves the static tree the marker lives in.
#[derive(Debug, Parser)]
#[command(name = "sema-server")]
struct Args {
	/// Directory served under /static; the marker file lives inside it.
	#[arg(long, env = "SEMA_STATIC_DIR", default_value = "public/static")]
	static_dir: PathBuf,

	/// Marker file whose presence flips the mode.
	#[arg(long, env = "SEMA_MARKER", default_value = "isUnderMaintenance.json")]
	marker: String,

	#[arg(long, env = "PORT", default_value_t = 3000)]
	port: u16,

	/// Heartbeat interval per subscription, in seconds.
	#[arg(long, env = "SEMA_HEARTBEAT_SECS", default_value_t = 10)]
	heartbeat_secs: u64,
}

#[derive(Debug, Clone)]
struct AppState {
	static_dir: PathBuf,
	marker: String,
	heartbeat: Duration,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			EnvFilter::new("info,sema_server=debug,sema_core=debug")
		}))
		.init();

	let args = Args::parse();

	let state = AppState {
		static_dir: args.static_dir.clone(),
		marker: args.marker,
		heartbeat: Duration::from_secs(args.heartbeat_secs),
	};

	let app = Router::new()
		.route("/", get(|| async { "Semaphore relay server" }))
		.route("/health", get(|| async { "OK" }))
		.route("/events", get(stream::events))
		.nest_service("/static", ServeDir::new(&args.static_dir))
		.with_state(state);

	// This listens on IPv6 and IPv4
	let mut addr = "[::]:3000".parse::<SocketAddr>().expect("hardcoded address");
	addr.set_port(args.port);

	let listener = TcpListener::bind(addr)
		.await
		.expect("Error binding HTTP listener!");
	info!("Listening on http://localhost:{}", args.port);

	axum::serve(
		listener,
		app.into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await
	.expect("Error with HTTP server!");
}

async fn shutdown_signal() {
	tokio::signal::ctrl_c()
		.await
		.expect("Error listening for shutdown signal!");
	info!("Shutdown signal received");
}
