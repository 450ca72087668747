//! Probe jobs and the bounded pool that runs them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};

use crate::db::{DbError, MetricSample, Store};
use crate::probe::{
    agent_client, fetch_extended_metrics, fetch_metrics, run_ping_probe, run_uptime_probe,
    uptime_client, PingOutcome, ProbeError, UptimeOutcome, AGENT_TIMEOUT, TCP_CONNECT_TIMEOUT,
    UPTIME_TIMEOUT,
};

/// One unit of probe work. Carries only the target id; the row is reloaded
/// when the job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Ping(i64),
    Metrics(i64),
    Shortcut(i64),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Ping(id) => write!(f, "ping server {}", id),
            Job::Metrics(id) => write!(f, "metrics for server {}", id),
            Job::Shortcut(id) => write!(f, "check shortcut {}", id),
        }
    }
}

/// Runs probes against registry targets and writes the results back.
pub struct Monitor {
    store: Arc<Store>,
    agent: reqwest::Client,
    uptime: reqwest::Client,
}

impl Monitor {
    pub fn new(store: Arc<Store>) -> Result<Self, ProbeError> {
        Ok(Self {
            store,
            agent: agent_client(AGENT_TIMEOUT)?,
            uptime: uptime_client(UPTIME_TIMEOUT)?,
        })
    }

    /// Run a job to completion, logging instead of returning failures.
    pub async fn run(&self, job: Job) {
        let result = match job {
            Job::Ping(id) => self.ping_server(id).await.map(|_| ()),
            Job::Metrics(id) => self.collect_metrics(id).await.map(|_| ()),
            Job::Shortcut(id) => self.check_shortcut(id).await.map(|_| ()),
        };

        match result {
            Ok(()) => {}
            // Deleted between dispatch and execution.
            Err(DbError::NotFound) => tracing::debug!("Skipping {}: target no longer exists", job),
            Err(e) => tracing::error!("Failed to record {}: {}", job, e),
        }
    }

    /// TCP-probe a server and record status, latency and `last_ping_at`.
    pub async fn ping_server(&self, id: i64) -> Result<PingOutcome, DbError> {
        let server = self.store.get_server(id)?;
        let outcome = run_ping_probe(&server.host, server.port, TCP_CONNECT_TIMEOUT).await;

        if outcome == PingOutcome::Offline {
            tracing::warn!("Server {} ({}) is offline", server.name, server.host);
        }

        self.store
            .record_ping(id, outcome.status(), outcome.latency_ms(), Utc::now())?;
        Ok(outcome)
    }

    /// Fetch one metrics snapshot from a server's agent and store it.
    ///
    /// Returns `Ok(None)` when the server has no agent or the fetch failed;
    /// in both cases nothing is written.
    pub async fn collect_metrics(&self, id: i64) -> Result<Option<MetricSample>, DbError> {
        let server = self.store.get_server(id)?;
        let agent_url = match server.agent_url.as_deref() {
            Some(url) if server.has_agent() => url,
            _ => return Ok(None),
        };

        let invoked_at = Utc::now();
        match fetch_metrics(&self.agent, agent_url, server.token(), AGENT_TIMEOUT).await {
            Ok(payload) => {
                let mut sample = payload.into_sample(id, invoked_at);
                self.store.record_metric_sample(&mut sample)?;
                Ok(Some(sample))
            }
            Err(e) => {
                tracing::warn!("Metrics fetch failed for server {}: {}", server.id, e);
                Ok(None)
            }
        }
    }

    /// HTTP-probe a shortcut and record its status.
    pub async fn check_shortcut(&self, id: i64) -> Result<UptimeOutcome, DbError> {
        let shortcut = self.store.get_shortcut(id)?;
        let outcome = run_uptime_probe(&self.uptime, &shortcut.url, UPTIME_TIMEOUT).await;

        if outcome.status_code.is_none() {
            tracing::warn!("Shortcut {} ({}) is unreachable", shortcut.name, shortcut.url);
        }

        self.store
            .record_shortcut_check(id, outcome.status, outcome.status_code, Utc::now())?;
        Ok(outcome)
    }

    /// Refresh the cached extended metrics for a server.
    ///
    /// Any failure falls back to the previously cached document.
    pub async fn refresh_extended_metrics(&self, id: i64) -> Option<serde_json::Value> {
        let server = match self.store.get_server(id) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Extended metrics: cannot load server {}: {}", id, e);
                return None;
            }
        };

        let cached = server.extended_metrics();
        let agent_url = match server.agent_url.as_deref() {
            Some(url) if server.has_agent() => url,
            _ => return cached,
        };

        let doc = match fetch_extended_metrics(&self.agent, agent_url, server.token(), AGENT_TIMEOUT).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Extended metrics fetch failed for server {}: {}", id, e);
                return cached;
            }
        };

        match self.store.record_extended_metrics(id, &doc.to_string(), Utc::now()) {
            Ok(()) => Some(doc),
            Err(e) => {
                tracing::warn!("Failed to cache extended metrics for server {}: {}", id, e);
                cached
            }
        }
    }
}

/// Bounded fire-and-forget job pool.
///
/// Jobs go through a fixed-size queue; a dispatcher task spawns one task per
/// job, with at most `max_concurrent` probes in flight.
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Create the pool. Must be called from within a tokio runtime.
    pub fn new(monitor: Arc<Monitor>, max_concurrent: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        tokio::spawn(run_dispatch_loop(rx, monitor, semaphore));

        Self { tx }
    }

    /// Enqueue a job without waiting. Returns false if it was dropped.
    pub fn dispatch(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("Dropping {}: dispatch queue is full", job);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::error!("Dropping {}: dispatcher has stopped", job);
                false
            }
        }
    }
}

async fn run_dispatch_loop(mut rx: mpsc::Receiver<Job>, monitor: Arc<Monitor>, semaphore: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let monitor = monitor.clone();
        tokio::spawn(async move {
            let _permit = permit; // Hold permit until done

            // Add jitter to avoid thundering herd
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            monitor.run(job).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Server, ServerStatus, Shortcut, ShortcutStatus};
    use crate::testutil::serve;

    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;
    use tempfile::NamedTempFile;
    use tokio_test::assert_ok;

    fn test_monitor() -> (NamedTempFile, Arc<Store>, Monitor) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let monitor = Monitor::new(store.clone()).unwrap();
        (tmp, store, monitor)
    }

    fn add_server(store: &Store, host: &str, port: Option<u16>, agent_url: Option<String>) -> i64 {
        let mut server = Server {
            name: "node".to_string(),
            host: host.to_string(),
            port,
            agent_url,
            ..Default::default()
        };
        store.add_server(&mut server).unwrap()
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_unreachable_ping_records_offline_and_timestamp() {
        let (_tmp, store, monitor) = test_monitor();
        let id = add_server(&store, "127.0.0.1", Some(closed_port()), None);
        store
            .record_ping(id, ServerStatus::Online, Some(3), Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        let before = store.get_server(id).unwrap().last_ping_at.unwrap();

        let outcome = assert_ok!(monitor.ping_server(id).await);
        assert_eq!(outcome, PingOutcome::Offline);

        let server = store.get_server(id).unwrap();
        assert_eq!(server.status, Some(ServerStatus::Offline));
        assert_eq!(server.ping_latency_ms, None);
        assert!(server.last_ping_at.unwrap() > before);
    }

    #[tokio::test]
    async fn test_reachable_ping_records_online_latency() {
        let (_tmp, store, monitor) = test_monitor();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let id = add_server(&store, "127.0.0.1", Some(port), None);

        assert_ok!(monitor.ping_server(id).await);

        let server = store.get_server(id).unwrap();
        assert_eq!(server.status, Some(ServerStatus::Online));
        assert!(server.ping_latency_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_metrics_non_2xx_leaves_state_untouched() {
        let (_tmp, store, monitor) = test_monitor();
        let app = Router::new().route("/metrics", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let addr = serve(app).await;
        let id = add_server(&store, "127.0.0.1", None, Some(format!("http://{}/metrics", addr)));

        let seeded_at = chrono::DateTime::parse_from_rfc3339("2026-01-19T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut seeded = MetricSample {
            id: 0,
            server_id: id,
            collected_at: seeded_at,
            cpu_usage: Some(5.0),
            memory_usage: None,
            disk_usage: None,
            load_avg: None,
            swap_usage: None,
            uptime_seconds: None,
            disk_read_bps: None,
            disk_write_bps: None,
            net_rx_bps: None,
            net_tx_bps: None,
            agent_version: None,
            fs_usage_json: None,
        };
        store.record_metric_sample(&mut seeded).unwrap();

        let sample = assert_ok!(monitor.collect_metrics(id).await);
        assert!(sample.is_none());

        let server = store.get_server(id).unwrap();
        assert_eq!(server.last_metrics_at, Some(seeded_at));
        let samples = store.get_metric_samples(id, 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].id, seeded.id);
        assert_eq!(samples[0].cpu_usage, Some(5.0));
    }

    #[tokio::test]
    async fn test_metrics_with_loosely_typed_fields_is_recorded() {
        let (_tmp, store, monitor) = test_monitor();
        let app = Router::new().route(
            "/metrics",
            get(|| async { Json(json!({"cpu_usage": 10.0, "uptime_seconds": 3600.0, "net_rx_bps": 1024.5})) }),
        );
        let addr = serve(app).await;
        let id = add_server(&store, "127.0.0.1", None, Some(format!("http://{}/metrics", addr)));

        let sample = assert_ok!(monitor.collect_metrics(id).await).unwrap();
        assert_eq!(sample.uptime_seconds, Some(3600));

        let samples = store.get_metric_samples(id, 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].cpu_usage, Some(10.0));
        assert_eq!(samples[0].net_rx_bps, Some(1024));
    }

    #[tokio::test]
    async fn test_metrics_2xx_creates_exactly_one_sample() {
        let (_tmp, store, monitor) = test_monitor();
        let app = Router::new().route(
            "/metrics",
            get(|| async {
                Json(json!({
                    "cpu_usage": 22.0,
                    "disk_usage": 70.5,
                    "fs_usage": [{"mount": "/", "used_percent": 70.5}],
                    "collected_at": "2026-01-19T10:00:00Z"
                }))
            }),
        );
        let addr = serve(app).await;
        let id = add_server(&store, "127.0.0.1", None, Some(format!("http://{}/metrics", addr)));

        let sample = assert_ok!(monitor.collect_metrics(id).await).unwrap();
        assert_eq!(sample.collected_at.to_rfc3339(), "2026-01-19T10:00:00+00:00");

        let samples = store.get_metric_samples(id, 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].disk_usage, Some(70.5));
        assert_eq!(samples[0].fs_usage()[0].mount, "/");
        assert_eq!(store.get_server(id).unwrap().last_metrics_at, Some(sample.collected_at));
    }

    #[tokio::test]
    async fn test_metrics_without_timestamp_uses_invocation_time() {
        let (_tmp, store, monitor) = test_monitor();
        let app = Router::new().route("/metrics", get(|| async { Json(json!({"cpu_usage": 1.0})) }));
        let addr = serve(app).await;
        let id = add_server(&store, "127.0.0.1", None, Some(format!("http://{}/metrics", addr)));

        let before = Utc::now();
        let sample = assert_ok!(monitor.collect_metrics(id).await).unwrap();
        let after = Utc::now();
        assert!(sample.collected_at >= before && sample.collected_at <= after);
    }

    #[tokio::test]
    async fn test_extended_metrics_falls_back_to_cache() {
        let (_tmp, store, monitor) = test_monitor();
        let app = Router::new().route(
            "/metrics/extended",
            get(|| async { Json(json!({"system": {"hostname": "box"}})) }),
        );
        let addr = serve(app).await;
        let id = add_server(&store, "127.0.0.1", None, Some(format!("http://{}/metrics", addr)));

        let fresh = monitor.refresh_extended_metrics(id).await.unwrap();
        assert_eq!(fresh["system"]["hostname"], "box");
        assert!(store.get_server(id).unwrap().extended_metrics_fetched_at.is_some());

        // Point the agent somewhere dead; the cached document comes back.
        let mut server = store.get_server(id).unwrap();
        server.agent_url = Some(format!("http://127.0.0.1:{}/metrics", closed_port()));
        store.update_server(&mut server).unwrap();

        let stale = monitor.refresh_extended_metrics(id).await.unwrap();
        assert_eq!(stale, fresh);

        assert!(monitor.refresh_extended_metrics(9999).await.is_none());
    }

    #[tokio::test]
    async fn test_shortcut_check_records_down_on_transport_error() {
        let (_tmp, store, monitor) = test_monitor();
        let mut shortcut = Shortcut {
            name: "Wiki".to_string(),
            url: format!("http://127.0.0.1:{}/", closed_port()),
            ..Default::default()
        };
        let id = store.add_shortcut(&mut shortcut).unwrap();

        let outcome = assert_ok!(monitor.check_shortcut(id).await);
        assert_eq!(outcome.status, ShortcutStatus::Down);

        let stored = store.get_shortcut(id).unwrap();
        assert_eq!(stored.last_status, Some(ShortcutStatus::Down));
        assert_eq!(stored.last_status_code, None);
        assert!(stored.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatched_job_writes_back() {
        let (_tmp, store, monitor) = test_monitor();
        let id = add_server(&store, "127.0.0.1", Some(closed_port()), None);
        let dispatcher = Dispatcher::new(Arc::new(monitor), 2, 8);

        assert!(dispatcher.dispatch(Job::Ping(id)));

        let mut status = None;
        for _ in 0..100 {
            status = store.get_server(id).unwrap().status;
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, Some(ServerStatus::Offline));
    }
}
