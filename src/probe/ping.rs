//! TCP liveness probe.
//!
//! Uses blocking sockets in spawn_blocking; the connection is closed as soon
//! as the handshake completes and no payload is exchanged.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::ProbeError;
use crate::db::ServerStatus;

/// Port used when a server has none configured.
pub const DEFAULT_PORT: u16 = 80;

/// Result of a TCP liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Online { latency_ms: i64 },
    Offline,
}

impl PingOutcome {
    pub fn status(&self) -> ServerStatus {
        match self {
            PingOutcome::Online { .. } => ServerStatus::Online,
            PingOutcome::Offline => ServerStatus::Offline,
        }
    }

    pub fn latency_ms(&self) -> Option<i64> {
        match self {
            PingOutcome::Online { latency_ms } => Some(*latency_ms),
            PingOutcome::Offline => None,
        }
    }
}

/// Probe `host:port` (port 80 when unset). Never fails: every error is offline.
pub async fn run_ping_probe(host: &str, port: Option<u16>, timeout: Duration) -> PingOutcome {
    let port = port.unwrap_or(DEFAULT_PORT);
    match tcp_connect(host, port, timeout).await {
        Ok(elapsed) => PingOutcome::Online {
            latency_ms: round_ms(elapsed),
        },
        Err(e) => {
            tracing::debug!("TCP probe to {}:{} failed: {}", host, port, e);
            PingOutcome::Offline
        }
    }
}

/// Open and immediately close a TCP connection.
///
/// Returns the wall-clock time spent resolving and connecting. The deadline
/// covers resolution too.
pub async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ProbeError::Config("blank host".to_string()));
    }

    let start = Instant::now();
    let deadline = start + timeout;

    let addrs = resolve_address(host, port, timeout).await?;

    tokio::task::spawn_blocking(move || connect_blocking(&addrs, deadline, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))??;

    Ok(start.elapsed())
}

/// Resolve hostname to socket addresses.
async fn resolve_address(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>, ProbeError> {
    // Try direct parse first, tolerating bracketed IPv6 literals
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    // DNS resolution
    let addrs: Vec<_> = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Network(format!("No addresses found for {}", host)));
    }
    Ok(addrs)
}

/// Try each address in turn until one connects or the deadline passes.
fn connect_blocking(addrs: &[SocketAddr], deadline: Instant, timeout: Duration) -> Result<(), ProbeError> {
    let mut last_err = None;

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ProbeError::Network(format!("Failed to create socket: {}", e)))?;

        match socket.connect_timeout(&(*addr).into(), remaining) {
            // Dropping the socket closes it.
            Ok(()) => return Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                last_err = Some(ProbeError::Timeout(timeout));
            }
            Err(e) => {
                last_err = Some(ProbeError::Network(format!("connect to {} failed: {}", addr, e)));
            }
        }
    }

    Err(last_err.unwrap_or(ProbeError::Timeout(timeout)))
}

fn round_ms(elapsed: Duration) -> i64 {
    (elapsed.as_secs_f64() * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_reachable_listener_is_online() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = run_ping_probe("127.0.0.1", Some(port), Duration::from_secs(2)).await;
        assert_eq!(outcome.status(), ServerStatus::Online);
        assert!(outcome.latency_ms().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_ping_closed_port_is_offline() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let outcome = run_ping_probe("127.0.0.1", Some(port), Duration::from_secs(2)).await;
        assert_eq!(outcome, PingOutcome::Offline);
        assert_eq!(outcome.latency_ms(), None);
    }

    #[tokio::test]
    async fn test_ping_blank_host_is_offline() {
        let outcome = run_ping_probe("   ", None, Duration::from_secs(2)).await;
        assert_eq!(outcome, PingOutcome::Offline);
    }

    #[tokio::test]
    async fn test_tcp_connect_rejects_blank_host() {
        let result = tcp_connect("", 80, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_round_ms() {
        assert_eq!(round_ms(Duration::from_micros(1_400)), 1);
        assert_eq!(round_ms(Duration::from_micros(1_600)), 2);
        assert_eq!(round_ms(Duration::ZERO), 0);
    }
}
