//! Proxied maintenance-flag check.
//!
//! Consumers never issue this GET themselves: the proxy re-issues it and
//! collapses every outcome, including transport failures, into a three-way
//! status. A benign 404 must never surface as an error to the caller.

use reqwest::StatusCode;
use tracing::debug;

/// Normalized outcome of the maintenance-flag check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStatus {
	/// The marker file is present.
	Maintenance,
	/// The marker file is absent.
	Operational,
	/// The check itself failed; there is no answer either way.
	Unknown,
}

/// Collapses an HTTP outcome into the three-way status: any 2xx means the
/// marker exists, any other response means it does not, and a failure to
/// get a response at all means we do not know.
pub fn normalize<E>(outcome: Result<StatusCode, E>) -> FlagStatus {
	match outcome {
		Ok(status) if status.is_success() => FlagStatus::Maintenance,
		Ok(_) => FlagStatus::Operational,
		Err(_) => FlagStatus::Unknown,
	}
}

pub async fn check_flag(client: &reqwest::Client, flag_url: &str) -> FlagStatus {
	// Unlike the events stream this is a one-shot request, so a total
	// timeout is safe and a slow response degrades to Unknown.
	let outcome = client
		.get(flag_url)
		.timeout(crate::DEFAULT_OPEN_TIMEOUT)
		.send()
		.await
		.map(|response| response.status());

	if let Err(e) = &outcome {
		debug!(error = %e, "Maintenance flag check failed;");
	}

	normalize(outcome)
}
