//! HTTP uptime probe for shortcuts.

use std::time::Duration;

use reqwest::{StatusCode, Url};

use super::{transport_error, ProbeError};
use crate::db::ShortcutStatus;

/// Result of an uptime probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UptimeOutcome {
    pub status: ShortcutStatus,
    /// Absent when no response was received at all.
    pub status_code: Option<u16>,
}

impl UptimeOutcome {
    fn from_code(code: u16) -> Self {
        let status = if (200..=399).contains(&code) {
            ShortcutStatus::Up
        } else {
            ShortcutStatus::Down
        };
        Self {
            status,
            status_code: Some(code),
        }
    }

    fn unreachable() -> Self {
        Self {
            status: ShortcutStatus::Down,
            status_code: None,
        }
    }
}

/// Check a URL with HEAD, retrying once with GET when HEAD is refused with 405.
///
/// Never fails: transport errors are reported as down with no status code.
pub async fn run_uptime_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> UptimeOutcome {
    match final_status(client, url, timeout).await {
        Ok(code) => UptimeOutcome::from_code(code),
        Err(e) => {
            tracing::debug!("Uptime probe for {} failed: {}", url, e);
            UptimeOutcome::unreachable()
        }
    }
}

async fn final_status(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<u16, ProbeError> {
    let url = Url::parse(url.trim()).map_err(|e| ProbeError::Config(e.to_string()))?;

    let response = client
        .head(url.clone())
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        return Ok(response.status().as_u16());
    }

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    Ok(response.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{uptime_client, UPTIME_TIMEOUT};
    use crate::testutil::serve;

    use axum::{http::Method, http::StatusCode as AxumStatus, routing::any, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A site that answers HEAD with `head` and GET with `get`, counting both.
    async fn site(head: AxumStatus, get: AxumStatus) -> (String, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let heads = Arc::new(AtomicUsize::new(0));
        let gets = Arc::new(AtomicUsize::new(0));
        let (h, g) = (heads.clone(), gets.clone());

        let app = Router::new().route(
            "/",
            any(move |method: Method| {
                let (h, g) = (h.clone(), g.clone());
                async move {
                    if method == Method::HEAD {
                        h.fetch_add(1, Ordering::SeqCst);
                        head
                    } else {
                        g.fetch_add(1, Ordering::SeqCst);
                        get
                    }
                }
            }),
        );
        let addr = serve(app).await;
        (format!("http://{}/", addr), heads, gets)
    }

    #[tokio::test]
    async fn test_head_405_retries_with_get_once() {
        let (url, heads, gets) = site(AxumStatus::METHOD_NOT_ALLOWED, AxumStatus::OK).await;
        let client = uptime_client(UPTIME_TIMEOUT).unwrap();

        let outcome = run_uptime_probe(&client, &url, UPTIME_TIMEOUT).await;
        assert_eq!(outcome.status, ShortcutStatus::Up);
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(heads.load(Ordering::SeqCst), 1);
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_retry_status_decides_classification() {
        let (url, _, gets) = site(AxumStatus::METHOD_NOT_ALLOWED, AxumStatus::SERVICE_UNAVAILABLE).await;
        let client = uptime_client(UPTIME_TIMEOUT).unwrap();

        let outcome = run_uptime_probe(&client, &url, UPTIME_TIMEOUT).await;
        assert_eq!(outcome.status, ShortcutStatus::Down);
        assert_eq!(outcome.status_code, Some(503));
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_head_404_is_down_without_retry() {
        let (url, _, gets) = site(AxumStatus::NOT_FOUND, AxumStatus::OK).await;
        let client = uptime_client(UPTIME_TIMEOUT).unwrap();

        let outcome = run_uptime_probe(&client, &url, UPTIME_TIMEOUT).await;
        assert_eq!(outcome, UptimeOutcome::from_code(404));
        assert_eq!(outcome.status, ShortcutStatus::Down);
        assert_eq!(gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_counts_as_up() {
        let (url, _, _) = site(AxumStatus::MOVED_PERMANENTLY, AxumStatus::OK).await;
        let client = uptime_client(UPTIME_TIMEOUT).unwrap();

        let outcome = run_uptime_probe(&client, &url, UPTIME_TIMEOUT).await;
        assert_eq!(outcome.status, ShortcutStatus::Up);
        assert_eq!(outcome.status_code, Some(301));
    }

    #[tokio::test]
    async fn test_unreachable_is_down_without_code() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = uptime_client(UPTIME_TIMEOUT).unwrap();

        let outcome = run_uptime_probe(&client, &format!("http://127.0.0.1:{}/", port), UPTIME_TIMEOUT).await;
        assert_eq!(outcome, UptimeOutcome::unreachable());

        let bad_url = run_uptime_probe(&client, "not a url", UPTIME_TIMEOUT).await;
        assert_eq!(bad_url.status_code, None);
    }
}
