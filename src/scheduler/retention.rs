//! Retention horizon for metric samples.

use crate::db::{DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Samples older than this many days are deleted.
pub const SAMPLE_RETENTION_DAYS: i64 = 7;

/// Delete every sample collected more than [`SAMPLE_RETENTION_DAYS`] before `now`.
pub fn prune_metric_samples(store: &Store, now: DateTime<Utc>) -> Result<usize, DbError> {
    store.delete_metric_samples_before(now - ChronoDuration::days(SAMPLE_RETENTION_DAYS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MetricSample, Server};
    use tempfile::NamedTempFile;

    fn sample(server_id: i64, collected_at: DateTime<Utc>) -> MetricSample {
        MetricSample {
            id: 0,
            server_id,
            collected_at,
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
            fs_usage_json: None,
        }
    }

    #[test]
    fn test_prune_respects_horizon() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut server = Server {
            name: "s".to_string(),
            host: "s.example".to_string(),
            ..Default::default()
        };
        let id = store.add_server(&mut server).unwrap();
        let now = Utc::now();

        for age in [
            ChronoDuration::days(30),
            ChronoDuration::days(7) + ChronoDuration::seconds(1),
            ChronoDuration::days(7) - ChronoDuration::seconds(1),
            ChronoDuration::hours(1),
        ] {
            store.record_metric_sample(&mut sample(id, now - age)).unwrap();
        }

        assert_eq!(prune_metric_samples(&store, now).unwrap(), 2);

        let horizon = now - ChronoDuration::days(SAMPLE_RETENTION_DAYS);
        let remaining = store.get_metric_samples(id, 100).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|s| s.collected_at >= horizon));

        // Idempotent.
        assert_eq!(prune_metric_samples(&store, now).unwrap(), 0);
    }
}
