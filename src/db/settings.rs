//! Process-wide key/value settings: feature toggles and run timestamps.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::DbError;

/// Gates the periodic server scan.
pub const SERVERS_CHECKS_ENABLED: &str = "servers_checks_enabled";
/// Gates the periodic shortcut scan.
pub const SHORTCUTS_CHECKS_ENABLED: &str = "shortcuts_checks_enabled";
/// Unix seconds of the last manual "run all servers now".
pub const SERVERS_CHECKS_LAST_RUN_AT: &str = "servers_checks_last_run_at";
/// Unix seconds of the last manual "run all shortcuts now".
pub const SHORTCUTS_CHECKS_LAST_RUN_AT: &str = "shortcuts_checks_last_run_at";

/// Narrow interface over the settings table.
///
/// Implementations must make `toggle_setting` and `try_mark_run` atomic with
/// respect to concurrent callers.
pub trait SettingsStore: Send + Sync {
    /// Raw value for `key`, or `None` when unset.
    fn get_setting(&self, key: &str) -> Result<Option<String>, DbError>;

    /// Insert or replace the value for `key`.
    fn set_setting(&self, key: &str, value: &str) -> Result<(), DbError>;

    /// Read a boolean flag. Only the literal `"true"` is truthy.
    fn setting_enabled(&self, key: &str, default: bool) -> Result<bool, DbError> {
        Ok(parse_flag(self.get_setting(key)?.as_deref(), default))
    }

    /// Flip a boolean flag and return the new value.
    fn toggle_setting(&self, key: &str, default: bool) -> Result<bool, DbError>;

    /// Record `now` under `key` unless the previous mark is younger than
    /// `window`. Returns whether the mark was written.
    fn try_mark_run(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<bool, DbError>;
}

pub(crate) fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(v) => v == "true",
        None => default,
    }
}

/// Whether a run marked at `last` (unix seconds) still blocks a run at `now`.
pub(crate) fn is_throttled(last: Option<&str>, window: Duration, now: DateTime<Utc>) -> bool {
    let last = match last.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s,
        None => return false,
    };
    // Garbage reads as epoch, which never throttles.
    let last: i64 = last.parse().unwrap_or(0);
    now.timestamp() - last < window.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(None, true));
        assert!(!parse_flag(None, false));
        assert!(parse_flag(Some("true"), false));
        assert!(!parse_flag(Some("TRUE"), true));
        assert!(!parse_flag(Some(""), true));
    }

    #[test]
    fn test_is_throttled_window() {
        let now = DateTime::from_timestamp(1_000_000, 0).unwrap();
        let window = Duration::from_secs(30);
        assert!(!is_throttled(None, window, now));
        assert!(!is_throttled(Some(""), window, now));
        assert!(is_throttled(Some("999990"), window, now));
        assert!(!is_throttled(Some("999970"), window, now));
        assert!(!is_throttled(Some("garbage"), window, now));
    }
}
