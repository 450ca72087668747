//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default probe interval for servers and shortcuts, in seconds.
pub const DEFAULT_INTERVAL_SECONDS: i64 = 60;
/// Smallest accepted probe interval, in seconds.
pub const MIN_INTERVAL_SECONDS: i64 = 6;
/// Largest accepted probe interval, in seconds.
pub const MAX_INTERVAL_SECONDS: i64 = 3600;

/// Liveness of a server as seen by the last TCP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(ServerStatus::Online),
            "offline" => Some(ServerStatus::Offline),
            _ => None,
        }
    }
}

/// Reachability of a shortcut as seen by the last uptime probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortcutStatus {
    Up,
    Down,
}

impl ShortcutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortcutStatus::Up => "up",
            ShortcutStatus::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(ShortcutStatus::Up),
            "down" => Some(ShortcutStatus::Down),
            _ => None,
        }
    }
}

/// A monitored host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub agent_url: Option<String>,
    #[serde(skip_serializing)]
    pub agent_token: Option<String>,
    pub ping_interval_seconds: i64,
    pub status: Option<ServerStatus>,
    pub last_ping_at: Option<DateTime<Utc>>,
    /// Only present while `status` is online.
    pub ping_latency_ms: Option<i64>,
    pub last_metrics_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub extended_metrics_json: Option<String>,
    pub extended_metrics_fetched_at: Option<DateTime<Utc>>,
    pub position: i64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: String::new(),
            port: None,
            agent_url: None,
            agent_token: None,
            ping_interval_seconds: DEFAULT_INTERVAL_SECONDS,
            status: None,
            last_ping_at: None,
            ping_latency_ms: None,
            last_metrics_at: None,
            extended_metrics_json: None,
            extended_metrics_fetched_at: None,
            position: 0,
        }
    }
}

impl Server {
    /// Whether a metrics agent is configured for this server.
    pub fn has_agent(&self) -> bool {
        self.agent_url
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false)
    }

    /// The agent token, if one is set and non-blank.
    pub fn token(&self) -> Option<&str> {
        self.agent_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Decode the cached extended metrics blob. Corrupt JSON reads as absent.
    pub fn extended_metrics(&self) -> Option<serde_json::Value> {
        self.extended_metrics_json
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

/// One filesystem entry reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsUsage {
    pub mount: String,
    #[serde(default)]
    pub used: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub used_percent: Option<f64>,
}

/// A single point-in-time measurement for a server. Never updated once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub id: i64,
    pub server_id: i64,
    pub collected_at: DateTime<Utc>,
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
    #[serde(skip_serializing)]
    pub fs_usage_json: Option<String>,
}

impl MetricSample {
    /// Decode the filesystem usage blob. Missing or corrupt JSON reads as empty.
    pub fn fs_usage(&self) -> Vec<FsUsage> {
        self.fs_usage_json
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

/// A monitored bookmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortcut {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub icon_url: Option<String>,
    pub category: Option<String>,
    pub position: i64,
    pub monitor_enabled: bool,
    pub check_interval_seconds: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_status: Option<ShortcutStatus>,
    pub last_status_code: Option<u16>,
}

impl Default for Shortcut {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            icon_url: None,
            category: None,
            position: 0,
            monitor_enabled: true,
            check_interval_seconds: DEFAULT_INTERVAL_SECONDS,
            last_checked_at: None,
            last_status: None,
            last_status_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_usage_decodes_lazily() {
        let sample = MetricSample {
            id: 1,
            server_id: 1,
            collected_at: Utc::now(),
            cpu_usage: None,
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
            fs_usage_json: Some(r#"[{"mount":"/","used_percent":41.5}]"#.to_string()),
        };
        let fs = sample.fs_usage();
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].mount, "/");
        assert_eq!(fs[0].used_percent, Some(41.5));

        let broken = MetricSample {
            fs_usage_json: Some("not json".to_string()),
            ..sample
        };
        assert!(broken.fs_usage().is_empty());
    }

    #[test]
    fn test_corrupt_extended_metrics_reads_as_none() {
        let server = Server {
            extended_metrics_json: Some("{oops".to_string()),
            ..Default::default()
        };
        assert!(server.extended_metrics().is_none());
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(ServerStatus::parse("online"), Some(ServerStatus::Online));
        assert_eq!(ShortcutStatus::parse("sideways"), None);
        assert_eq!(ShortcutStatus::Down.as_str(), "down");
    }
}
