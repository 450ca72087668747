//! Due-check evaluation.

use chrono::{DateTime, Utc};

/// Whether a target last checked at `last_checked_at` needs a new probe at `now`.
///
/// Never-checked targets are always due. The boundary is inclusive: a target
/// whose interval has exactly elapsed is due.
pub fn is_due(last_checked_at: Option<DateTime<Utc>>, interval_seconds: i64, now: DateTime<Utc>) -> bool {
    match last_checked_at {
        None => true,
        Some(last) => (now - last).num_milliseconds() >= interval_seconds.saturating_mul(1000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_never_checked_is_always_due() {
        let now = Utc::now();
        for interval in [0, 6, 60, 3600, i64::MAX] {
            assert!(is_due(None, interval, now));
        }
    }

    #[test]
    fn test_due_boundary_is_inclusive() {
        let last = Utc::now();
        assert!(!is_due(Some(last), 60, last + Duration::seconds(59)));
        assert!(!is_due(Some(last), 60, last + Duration::milliseconds(59_999)));
        assert!(is_due(Some(last), 60, last + Duration::seconds(60)));
        assert!(is_due(Some(last), 60, last + Duration::seconds(61)));
    }

    #[test]
    fn test_zero_interval_is_due_immediately() {
        let last = Utc::now();
        assert!(is_due(Some(last), 0, last));
    }

    #[test]
    fn test_future_timestamp_is_not_due() {
        let now = Utc::now();
        assert!(!is_due(Some(now + Duration::seconds(5)), 6, now));
    }
}
