//! Single-writer, multi-reader change-notification relay.
//!
//! The server side watches one directory for the presence of a marker file
//! and pushes mode transitions to any number of subscribers over a
//! server-sent-events stream. The client side owns exactly one of those
//! streams per process and multiplexes it to local consumers, with a
//! heartbeat watchdog that transparently re-establishes the connection when
//! it dies silently.

use std::time::Duration;

pub mod detector;
pub mod event;
pub mod proxy;
pub mod registry;

pub use detector::{Detector, DetectorError};
pub use event::{Mode, ModeEvent};

/// How often the server emits an `alive` frame on every subscription.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// How long the proxy waits for a heartbeat before forcing a reconnect.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(20);

/// Delay before retrying after an explicit transport error.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Upper bound on a single upstream open attempt or flag lookup. Keeps a
/// half-open connection from stalling the proxy driver.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
