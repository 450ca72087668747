//! Agent metrics probes.
//!
//! The agent serves a compact snapshot on its metrics URL and a larger,
//! free-form document on the sibling `/metrics/extended` endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde_json::{Map, Value};

use super::{transport_error, ProbeError};
use crate::db::MetricSample;

/// Header the bundled agent checks for its token.
pub const AGENT_TOKEN_HEADER: &str = "X-Stackscope-Token";

/// The known fields of an agent's metrics snapshot. Unknown fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct MetricsPayload {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub load_avg: Option<f64>,
    pub swap_usage: Option<f64>,
    pub uptime_seconds: Option<i64>,
    pub disk_read_bps: Option<i64>,
    pub disk_write_bps: Option<i64>,
    pub net_rx_bps: Option<i64>,
    pub net_tx_bps: Option<i64>,
    pub agent_version: Option<String>,
    pub fs_usage: Option<serde_json::Value>,
    pub collected_at: Option<String>,
}

impl MetricsPayload {
    /// Pick the known fields out of a snapshot object.
    ///
    /// Each field is read on its own: integers sent as floats are truncated,
    /// numeric versions are stringified and anything else of the wrong type
    /// reads as absent.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let float = |key: &str| map.get(key).and_then(Value::as_f64);
        let int = |key: &str| {
            map.get(key)
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        };

        Self {
            cpu_usage: float("cpu_usage"),
            memory_usage: float("memory_usage"),
            disk_usage: float("disk_usage"),
            load_avg: float("load_avg"),
            swap_usage: float("swap_usage"),
            uptime_seconds: int("uptime_seconds"),
            disk_read_bps: int("disk_read_bps"),
            disk_write_bps: int("disk_write_bps"),
            net_rx_bps: int("net_rx_bps"),
            net_tx_bps: int("net_tx_bps"),
            agent_version: map.get("agent_version").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            fs_usage: map.get("fs_usage").filter(|v| v.is_array()).cloned(),
            collected_at: map.get("collected_at").and_then(Value::as_str).map(str::to_string),
        }
    }

    /// The agent's own timestamp when it is valid RFC 3339, else `fallback`.
    pub fn collected_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.collected_at
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fallback)
    }

    /// Turn the payload into an unsaved sample for `server_id`.
    pub fn into_sample(self, server_id: i64, fallback: DateTime<Utc>) -> MetricSample {
        let collected_at = self.collected_at(fallback);
        let fs_usage_json = self
            .fs_usage
            .filter(|v| !v.is_null())
            .map(|v| v.to_string());

        MetricSample {
            id: 0,
            server_id,
            collected_at,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            disk_usage: self.disk_usage,
            load_avg: self.load_avg,
            swap_usage: self.swap_usage,
            uptime_seconds: self.uptime_seconds,
            disk_read_bps: self.disk_read_bps,
            disk_write_bps: self.disk_write_bps,
            net_rx_bps: self.net_rx_bps,
            net_tx_bps: self.net_tx_bps,
            agent_version: self.agent_version,
            fs_usage_json,
        }
    }
}

/// Fetch the metrics snapshot from an agent.
///
/// Fails on transport errors, non-2xx responses and bodies that are not a
/// JSON object.
pub async fn fetch_metrics(
    client: &reqwest::Client,
    agent_url: &str,
    token: Option<&str>,
    timeout: Duration,
) -> Result<MetricsPayload, ProbeError> {
    let url = Url::parse(agent_url.trim()).map_err(|e| ProbeError::Config(e.to_string()))?;
    let body = get_json(client, url, token, timeout).await?;

    match body.as_object() {
        Some(map) => Ok(MetricsPayload::from_map(map)),
        None => Err(ProbeError::Payload("expected a JSON object".to_string())),
    }
}

/// Fetch the extended metrics document from an agent.
pub async fn fetch_extended_metrics(
    client: &reqwest::Client,
    agent_url: &str,
    token: Option<&str>,
    timeout: Duration,
) -> Result<serde_json::Value, ProbeError> {
    let url = extended_metrics_url(agent_url)?;
    get_json(client, url, token, timeout).await
}

/// Derive the extended endpoint from an agent URL.
///
/// A trailing `/metrics` (or `/metrics/extended`, or bare slashes) is replaced
/// with `/metrics/extended`; any other path gets it appended. The query string
/// is kept.
pub fn extended_metrics_url(agent_url: &str) -> Result<Url, ProbeError> {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let suffix = SUFFIX.get_or_init(|| Regex::new(r"(?:/metrics(?:/extended)?)?/*$").unwrap());

    let mut url = Url::parse(agent_url.trim()).map_err(|e| ProbeError::Config(e.to_string()))?;
    let path = suffix.replace(url.path(), "/metrics/extended").into_owned();
    url.set_path(&path);
    Ok(url)
}

async fn get_json(
    client: &reqwest::Client,
    url: Url,
    token: Option<&str>,
    timeout: Duration,
) -> Result<serde_json::Value, ProbeError> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token).header(AGENT_TOKEN_HEADER, token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    serde_json::from_slice(&body).map_err(|e| ProbeError::Payload(e.to_string()))
}
