//! Debounce for manually triggered "run everything now" actions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::{DbError, SettingsStore};

/// Minimum spacing between two manual runs of the same family.
pub const RUN_DEBOUNCE: Duration = Duration::from_secs(30);

/// Persisted, per-key run throttle.
pub struct Debouncer {
    settings: Arc<dyn SettingsStore>,
    window: Duration,
}

impl Debouncer {
    pub fn new(settings: Arc<dyn SettingsStore>, window: Duration) -> Self {
        Self { settings, window }
    }

    /// Claim a run for `key` now. Returns false if the last run was too recent.
    pub fn try_trigger(&self, key: &str) -> Result<bool, DbError> {
        self.try_trigger_at(key, Utc::now())
    }

    pub fn try_trigger_at(&self, key: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
        let triggered = self.settings.try_mark_run(key, self.window, now)?;
        if !triggered {
            tracing::debug!("Run for {} throttled (window {:?})", key, self.window);
        }
        Ok(triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_debounce_window() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let debouncer = Debouncer::new(store.clone(), RUN_DEBOUNCE);
        let now = Utc::now();

        assert!(debouncer.try_trigger_at("family_a", now).unwrap());
        assert!(!debouncer.try_trigger_at("family_a", now + ChronoDuration::seconds(10)).unwrap());
        // Keys are independent.
        assert!(debouncer.try_trigger_at("family_b", now).unwrap());
        assert!(debouncer.try_trigger_at("family_a", now + ChronoDuration::seconds(30)).unwrap());
    }

    #[test]
    fn test_debounce_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let now = Utc::now();
        {
            let store = Arc::new(Store::new(tmp.path()).unwrap());
            let debouncer = Debouncer::new(store, RUN_DEBOUNCE);
            assert!(debouncer.try_trigger_at("family", now).unwrap());
        }

        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let debouncer = Debouncer::new(store, RUN_DEBOUNCE);
        assert!(!debouncer.try_trigger_at("family", now + ChronoDuration::seconds(5)).unwrap());
    }
}
