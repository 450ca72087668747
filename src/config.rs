//! Configuration module for Stackscope.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the JSON API (default: 3000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "stackscope.db")
    pub db_path: String,
    /// How often the server scan runs, in seconds (default: 10)
    pub server_scan_secs: u64,
    /// How often the shortcut scan runs, in seconds (default: 10)
    pub shortcut_scan_secs: u64,
    /// How often old metric samples are pruned, in seconds (default: 3600)
    pub prune_secs: u64,
    /// Upper bound on probes running at the same time (default: 16)
    pub max_concurrent_probes: usize,
    /// Capacity of the dispatch queue (default: 1000)
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            db_path: "stackscope.db".to_string(),
            server_scan_secs: 10,
            shortcut_scan_secs: 10,
            prune_secs: 3600,
            max_concurrent_probes: 16,
            queue_capacity: 1000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STACKSCOPE_HTTP_PORT`: HTTP port (default: 3000)
    /// - `STACKSCOPE_DB_PATH`: Database file path (default: "stackscope.db")
    /// - `STACKSCOPE_SERVER_SCAN_SECS`: server scan cadence (default: 10)
    /// - `STACKSCOPE_SHORTCUT_SCAN_SECS`: shortcut scan cadence (default: 10)
    /// - `STACKSCOPE_PRUNE_SECS`: sample pruning cadence (default: 3600)
    /// - `STACKSCOPE_MAX_CONCURRENT_PROBES`: concurrent probe limit (default: 16)
    /// - `STACKSCOPE_QUEUE_CAPACITY`: dispatch queue size (default: 1000)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("STACKSCOPE_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("STACKSCOPE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_var::<u64>("STACKSCOPE_SERVER_SCAN_SECS") {
            cfg.server_scan_secs = secs.max(1);
        }
        if let Some(secs) = parse_var::<u64>("STACKSCOPE_SHORTCUT_SCAN_SECS") {
            cfg.shortcut_scan_secs = secs.max(1);
        }
        if let Some(secs) = parse_var::<u64>("STACKSCOPE_PRUNE_SECS") {
            cfg.prune_secs = secs.max(1);
        }
        if let Some(n) = parse_var::<usize>("STACKSCOPE_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = n.max(1);
        }
        if let Some(n) = parse_var::<usize>("STACKSCOPE_QUEUE_CAPACITY") {
            cfg.queue_capacity = n.max(1);
        }

        cfg
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            server_scan_interval: Duration::from_secs(self.server_scan_secs),
            shortcut_scan_interval: Duration::from_secs(self.shortcut_scan_secs),
            prune_interval: Duration::from_secs(self.prune_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 3000);
        assert_eq!(cfg.db_path, "stackscope.db");
        assert_eq!(cfg.max_concurrent_probes, 16);
    }

    #[test]
    fn test_scheduler_config_from_defaults() {
        let sched = ServerConfig::default().scheduler();
        assert_eq!(sched.server_scan_interval, Duration::from_secs(10));
        assert_eq!(sched.prune_interval, Duration::from_secs(3600));
        assert_eq!(sched.queue_capacity, 1000);
    }
}
