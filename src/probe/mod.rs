//! Probe module for network monitoring.
//!
//! Supports TCP liveness, agent metrics, extended agent metrics and HTTP
//! uptime probes. Every probe is bounded by a hard deadline.

mod http;
mod metrics;
mod ping;

pub use http::*;
pub use metrics::*;
pub use ping::*;

use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

/// Connect deadline for the TCP liveness probe.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Open and read deadline for agent requests.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(4);
/// Open and read deadline for shortcut uptime requests.
pub const UPTIME_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Build the client used for agent requests.
///
/// `timeout` bounds connecting; the whole exchange gets twice that, covering
/// the read.
pub fn agent_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    build_client(timeout)
}

/// Build the client used for shortcut uptime checks.
pub fn uptime_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    build_client(timeout)
}

// Redirects are not followed: a 3xx is a final answer for both agents and
// shortcuts. Targets are probed directly, never through a proxy.
fn build_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout * 2)
        .redirect(Policy::none())
        .no_proxy()
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}
