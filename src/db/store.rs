//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::settings::{is_throttled, parse_flag, SettingsStore};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl DbError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DbError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const SERVER_COLUMNS: &str = "id, name, host, port, agent_url, agent_token, ping_interval_seconds, \
     status, last_ping_at, ping_latency_ms, last_metrics_at, extended_metrics_json, \
     extended_metrics_fetched_at, position";

const SHORTCUT_COLUMNS: &str = "id, name, url, icon_url, category, position, monitor_enabled, \
     check_interval_seconds, last_checked_at, last_status, last_status_code";

const SAMPLE_COLUMNS: &str = "id, server_id, collected_at, cpu_usage, memory_usage, disk_usage, \
     load_avg, swap_usage, uptime_seconds, disk_read_bps, disk_write_bps, net_rx_bps, net_tx_bps, \
     agent_version, fs_usage_json";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the connection and bring the schema up to date.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(())
    }

    // A panic while holding the lock leaves SQLite itself consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Server CRUD ---

    /// Add a new server and return its ID.
    pub fn add_server(&self, server: &mut Server) -> Result<i64, DbError> {
        normalize_server(server);
        validate_server(server)?;

        let conn = self.lock();
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM servers",
            [],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO servers (name, host, port, agent_url, agent_token, ping_interval_seconds, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                server.name,
                server.host,
                server.port,
                server.agent_url,
                server.agent_token,
                server.ping_interval_seconds,
                position,
            ],
        )?;
        let id = conn.last_insert_rowid();
        server.id = id;
        server.position = position;
        Ok(id)
    }

    /// Update the operator-owned fields of an existing server.
    ///
    /// Probe-owned state (status, timestamps, latency, cached metrics) is left alone.
    pub fn update_server(&self, server: &mut Server) -> Result<(), DbError> {
        normalize_server(server);
        validate_server(server)?;

        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE servers SET name=?1, host=?2, port=?3, agent_url=?4, agent_token=?5,
             ping_interval_seconds=?6, updated_at=CURRENT_TIMESTAMP WHERE id=?7",
            params![
                server.name,
                server.host,
                server.port,
                server.agent_url,
                server.agent_token,
                server.ping_interval_seconds,
                server.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all servers in display order.
    pub fn get_servers(&self) -> Result<Vec<Server>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY position ASC, name ASC"
        ))?;

        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(servers)
    }

    /// Get a server by ID.
    pub fn get_server(&self, id: i64) -> Result<Server, DbError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
            params![id],
            server_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a server and its samples.
    pub fn delete_server(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM metric_samples WHERE server_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Rewrite server positions to match the order of `ids`.
    pub fn reorder_servers(&self, ids: &[i64]) -> Result<(), DbError> {
        self.reorder("servers", ids)
    }

    // --- Probe-owned server state ---

    /// Record the outcome of a TCP liveness probe.
    ///
    /// Latency is only kept for online servers.
    pub fn record_ping(
        &self,
        id: i64,
        status: ServerStatus,
        latency_ms: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let latency = match status {
            ServerStatus::Online => latency_ms.map(|ms| ms.max(0)),
            ServerStatus::Offline => None,
        };
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE servers SET status=?1, ping_latency_ms=?2, last_ping_at=?3 WHERE id=?4",
            params![status.as_str(), latency, format_db_time(at), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Overwrite the cached extended metrics blob for a server.
    pub fn record_extended_metrics(&self, id: i64, json: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE servers SET extended_metrics_json=?1, extended_metrics_fetched_at=?2 WHERE id=?3",
            params![json, format_db_time(at), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Metric Samples ---

    /// Append a sample and advance the owning server's `last_metrics_at`.
    pub fn record_metric_sample(&self, sample: &mut MetricSample) -> Result<i64, DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let collected_at = format_db_time(sample.collected_at);

        let changed = tx.execute(
            "UPDATE servers SET last_metrics_at=?1 WHERE id=?2",
            params![collected_at, sample.server_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }

        tx.execute(
            "INSERT INTO metric_samples (server_id, collected_at, cpu_usage, memory_usage, disk_usage,
             load_avg, swap_usage, uptime_seconds, disk_read_bps, disk_write_bps, net_rx_bps,
             net_tx_bps, agent_version, fs_usage_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                sample.server_id,
                collected_at,
                sample.cpu_usage,
                sample.memory_usage,
                sample.disk_usage,
                sample.load_avg,
                sample.swap_usage,
                sample.uptime_seconds,
                sample.disk_read_bps,
                sample.disk_write_bps,
                sample.net_rx_bps,
                sample.net_tx_bps,
                sample.agent_version,
                sample.fs_usage_json,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        sample.id = id;
        Ok(id)
    }

    /// Most recent samples for a server, newest first.
    pub fn get_metric_samples(&self, server_id: i64, limit: i64) -> Result<Vec<MetricSample>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM metric_samples
             WHERE server_id = ?1 ORDER BY collected_at DESC, id DESC LIMIT ?2"
        ))?;

        let samples = stmt
            .query_map(params![server_id, limit], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// The newest sample for a server, if any.
    pub fn latest_metric_sample(&self, server_id: i64) -> Result<Option<MetricSample>, DbError> {
        Ok(self.get_metric_samples(server_id, 1)?.into_iter().next())
    }

    /// Bulk-delete every sample collected before `cutoff`.
    pub fn delete_metric_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM metric_samples WHERE collected_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Shortcut CRUD ---

    /// Add a new shortcut at the end of the list and return its ID.
    pub fn add_shortcut(&self, shortcut: &mut Shortcut) -> Result<i64, DbError> {
        normalize_shortcut(shortcut);
        validate_shortcut(shortcut)?;

        let conn = self.lock();
        shortcut.position = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM shortcuts",
            [],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO shortcuts (name, url, icon_url, category, position, monitor_enabled, check_interval_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                shortcut.name,
                shortcut.url,
                shortcut.icon_url,
                shortcut.category,
                shortcut.position,
                shortcut.monitor_enabled,
                shortcut.check_interval_seconds,
            ],
        )?;
        let id = conn.last_insert_rowid();
        shortcut.id = id;
        Ok(id)
    }

    /// Update the operator-owned fields of an existing shortcut.
    pub fn update_shortcut(&self, shortcut: &mut Shortcut) -> Result<(), DbError> {
        normalize_shortcut(shortcut);
        validate_shortcut(shortcut)?;

        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE shortcuts SET name=?1, url=?2, icon_url=?3, category=?4, position=?5,
             monitor_enabled=?6, check_interval_seconds=?7, updated_at=CURRENT_TIMESTAMP WHERE id=?8",
            params![
                shortcut.name,
                shortcut.url,
                shortcut.icon_url,
                shortcut.category,
                shortcut.position,
                shortcut.monitor_enabled,
                shortcut.check_interval_seconds,
                shortcut.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all shortcuts grouped by category, then display order.
    pub fn get_shortcuts(&self) -> Result<Vec<Shortcut>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SHORTCUT_COLUMNS} FROM shortcuts
             ORDER BY COALESCE(category, '') ASC, position ASC, name ASC"
        ))?;

        let shortcuts = stmt
            .query_map([], shortcut_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(shortcuts)
    }

    /// Get a shortcut by ID.
    pub fn get_shortcut(&self, id: i64) -> Result<Shortcut, DbError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SHORTCUT_COLUMNS} FROM shortcuts WHERE id = ?1"),
            params![id],
            shortcut_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a shortcut.
    pub fn delete_shortcut(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM shortcuts WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Rewrite shortcut positions to match the order of `ids`.
    pub fn reorder_shortcuts(&self, ids: &[i64]) -> Result<(), DbError> {
        self.reorder("shortcuts", ids)
    }

    /// Record the outcome of an uptime probe.
    pub fn record_shortcut_check(
        &self,
        id: i64,
        status: ShortcutStatus,
        status_code: Option<u16>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE shortcuts SET last_status=?1, last_status_code=?2, last_checked_at=?3 WHERE id=?4",
            params![status.as_str(), status_code, format_db_time(at), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn reorder(&self, table: &'static str, ids: &[i64]) -> Result<(), DbError> {
        if ids.is_empty() {
            return Ok(());
        }

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!("UPDATE {table} SET position = ?1 WHERE id = ?2"))?;
            for (position, id) in ids.iter().enumerate() {
                stmt.execute(params![position as i64, id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

impl SettingsStore for Store {
    fn get_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.lock();
        read_setting(&conn, key)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.lock();
        write_setting(&conn, key, value)
    }

    fn toggle_setting(&self, key: &str, default: bool) -> Result<bool, DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = !parse_flag(read_setting(&tx, key)?.as_deref(), default);
        write_setting(&tx, key, if next { "true" } else { "false" })?;
        tx.commit()?;
        Ok(next)
    }

    fn try_mark_run(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<bool, DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if is_throttled(read_setting(&tx, key)?.as_deref(), window, now) {
            return Ok(false);
        }
        write_setting(&tx, key, &now.timestamp().to_string())?;
        tx.commit()?;
        Ok(true)
    }
}

fn read_setting(conn: &Connection, key: &str) -> Result<Option<String>, DbError> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

fn write_setting(conn: &Connection, key: &str, value: &str) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=CURRENT_TIMESTAMP",
        params![key, value],
    )?;
    Ok(())
}

// --- Validation ---

fn normalize_server(server: &mut Server) {
    server.name = server.name.trim().to_string();
    server.host = server.host.trim().to_string();
    server.agent_url = blank_to_none(server.agent_url.take());
    server.agent_token = blank_to_none(server.agent_token.take());
}

fn normalize_shortcut(shortcut: &mut Shortcut) {
    shortcut.name = shortcut.name.trim().to_string();
    shortcut.url = shortcut.url.trim().to_string();
    shortcut.icon_url = blank_to_none(shortcut.icon_url.take());
    shortcut.category = blank_to_none(shortcut.category.take());
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reject a server whose configuration could never be probed.
pub fn validate_server(server: &Server) -> Result<(), DbError> {
    if server.name.trim().is_empty() {
        return Err(DbError::invalid("name", "must not be blank"));
    }
    if server.host.trim().is_empty() {
        return Err(DbError::invalid("host", "must not be blank"));
    }
    if server.port == Some(0) {
        return Err(DbError::invalid("port", "must be between 1 and 65535"));
    }
    if let Some(url) = &server.agent_url {
        validate_http_url("agent_url", url)?;
    }
    validate_interval("ping_interval_seconds", server.ping_interval_seconds)
}

/// Reject a shortcut whose configuration could never be probed.
pub fn validate_shortcut(shortcut: &Shortcut) -> Result<(), DbError> {
    if shortcut.name.trim().is_empty() {
        return Err(DbError::invalid("name", "must not be blank"));
    }
    validate_http_url("url", &shortcut.url)?;
    validate_interval("check_interval_seconds", shortcut.check_interval_seconds)
}

fn validate_interval(field: &'static str, secs: i64) -> Result<(), DbError> {
    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&secs) {
        return Err(DbError::invalid(
            field,
            format!("must be between {MIN_INTERVAL_SECONDS} and {MAX_INTERVAL_SECONDS} seconds"),
        ));
    }
    Ok(())
}

fn validate_http_url(field: &'static str, raw: &str) -> Result<(), DbError> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| DbError::invalid(field, format!("not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DbError::invalid(field, "must use http or https"));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(DbError::invalid(field, "must include a host"));
    }
    Ok(())
}

// --- Row mapping ---

fn server_from_row(row: &Row<'_>) -> SqlResult<Server> {
    let port: Option<i64> = row.get(3)?;
    let status: Option<String> = row.get(7)?;
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: port.and_then(|p| u16::try_from(p).ok()),
        agent_url: row.get(4)?,
        agent_token: row.get(5)?,
        ping_interval_seconds: row.get(6)?,
        status: status.as_deref().and_then(ServerStatus::parse),
        last_ping_at: get_time(row, 8)?,
        ping_latency_ms: row.get(9)?,
        last_metrics_at: get_time(row, 10)?,
        extended_metrics_json: row.get(11)?,
        extended_metrics_fetched_at: get_time(row, 12)?,
        position: row.get(13)?,
    })
}

fn shortcut_from_row(row: &Row<'_>) -> SqlResult<Shortcut> {
    let status: Option<String> = row.get(9)?;
    let code: Option<i64> = row.get(10)?;
    Ok(Shortcut {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        icon_url: row.get(3)?,
        category: row.get(4)?,
        position: row.get(5)?,
        monitor_enabled: row.get(6)?,
        check_interval_seconds: row.get(7)?,
        last_checked_at: get_time(row, 8)?,
        last_status: status.as_deref().and_then(ShortcutStatus::parse),
        last_status_code: code.and_then(|c| u16::try_from(c).ok()),
    })
}

fn sample_from_row(row: &Row<'_>) -> SqlResult<MetricSample> {
    let time_str: String = row.get(2)?;
    Ok(MetricSample {
        id: row.get(0)?,
        server_id: row.get(1)?,
        collected_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
        cpu_usage: row.get(3)?,
        memory_usage: row.get(4)?,
        disk_usage: row.get(5)?,
        load_avg: row.get(6)?,
        swap_usage: row.get(7)?,
        uptime_seconds: row.get(8)?,
        disk_read_bps: row.get(9)?,
        disk_write_bps: row.get(10)?,
        net_rx_bps: row.get(11)?,
        net_tx_bps: row.get(12)?,
        agent_version: row.get(13)?,
        fs_usage_json: row.get(14)?,
    })
}

fn get_time(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_db_time))
}

/// Format a timestamp the way it is stored; lexical order matches time order.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
