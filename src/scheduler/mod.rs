//! Scheduler module: decides what is due, dispatches probes and ages out data.

mod debounce;
mod due;
mod jobs;
mod retention;

pub use debounce::*;
pub use due::*;
pub use jobs::*;
pub use retention::*;

use crate::db::{
    DbError, Server, SettingsStore, Shortcut, Store, SERVERS_CHECKS_ENABLED, SERVERS_CHECKS_LAST_RUN_AT,
    SHORTCUTS_CHECKS_ENABLED, SHORTCUTS_CHECKS_LAST_RUN_AT,
};
use crate::probe::ProbeError;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("probe setup failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub server_scan_interval: Duration,
    pub shortcut_scan_interval: Duration,
    pub prune_interval: Duration,
    pub max_concurrent_probes: usize,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_scan_interval: Duration::from_secs(10),
            shortcut_scan_interval: Duration::from_secs(10),
            prune_interval: Duration::from_secs(3600),
            max_concurrent_probes: 16,
            queue_capacity: 1000,
        }
    }
}

/// A family of checks sharing a feature flag and a run debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Servers,
    Shortcuts,
}

impl Family {
    pub fn enabled_key(&self) -> &'static str {
        match self {
            Family::Servers => SERVERS_CHECKS_ENABLED,
            Family::Shortcuts => SHORTCUTS_CHECKS_ENABLED,
        }
    }

    pub fn last_run_key(&self) -> &'static str {
        match self {
            Family::Servers => SERVERS_CHECKS_LAST_RUN_AT,
            Family::Shortcuts => SHORTCUTS_CHECKS_LAST_RUN_AT,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Family::Servers => "Server",
            Family::Shortcuts => "Shortcut",
        }
    }
}

/// What a scan pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// The family's flag was off and nothing was looked at.
    pub disabled: bool,
    pub dispatched: usize,
    pub not_due: usize,
    /// Jobs lost to a full queue; their targets stay due.
    pub dropped: usize,
}

impl ScanSummary {
    fn disabled() -> Self {
        Self {
            disabled: true,
            ..Default::default()
        }
    }

    fn record(&mut self, accepted: bool) {
        if accepted {
            self.dispatched += 1;
        } else {
            self.dropped += 1;
        }
    }
}

/// Result of a manual "run now" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub triggered: bool,
    pub message: String,
}

/// The monitoring engine: periodic scans, manual runs and on-demand checks.
pub struct Scheduler {
    store: Arc<Store>,
    settings: Arc<dyn SettingsStore>,
    monitor: Arc<Monitor>,
    dispatcher: Dispatcher,
    debouncer: Debouncer,
    config: SchedulerConfig,
    stop: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a scheduler backed by `store` for both targets and settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<Store>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let settings: Arc<dyn SettingsStore> = store.clone();
        Self::with_settings(store, settings, config)
    }

    /// Create a scheduler with a separate settings backend.
    pub fn with_settings(
        store: Arc<Store>,
        settings: Arc<dyn SettingsStore>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let monitor = Arc::new(Monitor::new(store.clone())?);
        let dispatcher = Dispatcher::new(monitor.clone(), config.max_concurrent_probes, config.queue_capacity);
        let debouncer = Debouncer::new(settings.clone(), RUN_DEBOUNCE);
        let (stop, _) = broadcast::channel(1);

        Ok(Self {
            store,
            settings,
            monitor,
            dispatcher,
            debouncer,
            config,
            stop,
        })
    }

    /// Start the periodic scan loops and the sample pruning loop.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Starting scheduler (servers every {:?}, shortcuts every {:?})",
            self.config.server_scan_interval,
            self.config.shortcut_scan_interval
        );

        self.spawn_scan_loop(Family::Servers, self.config.server_scan_interval);
        self.spawn_scan_loop(Family::Shortcuts, self.config.shortcut_scan_interval);
        self.spawn_prune_loop(self.config.prune_interval);
    }

    /// Stop the periodic loops. Jobs already dispatched run to completion.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    fn spawn_scan_loop(self: &Arc<Self>, family: Family, period: Duration) {
        let scheduler = Arc::clone(self);
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let result = match family {
                            Family::Servers => scheduler.trigger_server_scan(),
                            Family::Shortcuts => scheduler.trigger_shortcut_scan(),
                        };
                        match result {
                            Ok(summary) if summary.dispatched > 0 || summary.dropped > 0 => {
                                tracing::debug!("{} scan: {:?}", family.label(), summary);
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("{} scan failed: {}", family.label(), e),
                        }
                    }
                }
            }
        });
    }

    // The first pass runs immediately.
    fn spawn_prune_loop(self: &Arc<Self>, period: Duration) {
        let scheduler = Arc::clone(self);
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => match scheduler.prune_samples() {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Pruned {} metric samples", n),
                        Err(e) => tracing::error!("Failed to prune metric samples: {}", e),
                    },
                }
            }
        });
    }

    // --- Periodic scans ---

    /// Dispatch ping and metrics jobs for every server that is due.
    pub fn trigger_server_scan(&self) -> Result<ScanSummary, SchedulerError> {
        self.scan_servers_at(Utc::now())
    }

    fn scan_servers_at(&self, now: DateTime<Utc>) -> Result<ScanSummary, SchedulerError> {
        if !self.checks_enabled(Family::Servers)? {
            return Ok(ScanSummary::disabled());
        }

        let mut summary = ScanSummary::default();
        for server in self.store.get_servers()? {
            if !is_due(server.last_ping_at, server.ping_interval_seconds, now) {
                summary.not_due += 1;
                continue;
            }
            self.dispatch_server(&server, &mut summary);
        }
        Ok(summary)
    }

    /// Dispatch an uptime check for every monitored shortcut that is due.
    pub fn trigger_shortcut_scan(&self) -> Result<ScanSummary, SchedulerError> {
        self.scan_shortcuts_at(Utc::now())
    }

    fn scan_shortcuts_at(&self, now: DateTime<Utc>) -> Result<ScanSummary, SchedulerError> {
        if !self.checks_enabled(Family::Shortcuts)? {
            return Ok(ScanSummary::disabled());
        }

        let mut summary = ScanSummary::default();
        for shortcut in self.store.get_shortcuts()? {
            if !shortcut.monitor_enabled {
                continue;
            }
            if !is_due(shortcut.last_checked_at, shortcut.check_interval_seconds, now) {
                summary.not_due += 1;
                continue;
            }
            summary.record(self.dispatcher.dispatch(Job::Shortcut(shortcut.id)));
        }
        Ok(summary)
    }

    // Ping and metrics are separate jobs so one failing never holds up the other.
    fn dispatch_server(&self, server: &Server, summary: &mut ScanSummary) {
        summary.record(self.dispatcher.dispatch(Job::Ping(server.id)));
        if server.has_agent() {
            summary.record(self.dispatcher.dispatch(Job::Metrics(server.id)));
        }
    }

    // --- Manual runs ---

    /// Check every server now, unless a manual run happened in the last 30s.
    pub fn run_servers_now(&self) -> Result<RunOutcome, SchedulerError> {
        self.run_now(Family::Servers)
    }

    /// Check every monitored shortcut now, unless a manual run happened in the last 30s.
    pub fn run_shortcuts_now(&self) -> Result<RunOutcome, SchedulerError> {
        self.run_now(Family::Shortcuts)
    }

    fn run_now(&self, family: Family) -> Result<RunOutcome, SchedulerError> {
        let claimed = self.debouncer.try_trigger(family.last_run_key())?;
        self.run_claimed(family, claimed)
    }

    #[cfg(test)]
    fn run_now_at(&self, family: Family, now: DateTime<Utc>) -> Result<RunOutcome, SchedulerError> {
        let claimed = self.debouncer.try_trigger_at(family.last_run_key(), now)?;
        self.run_claimed(family, claimed)
    }

    fn run_claimed(&self, family: Family, claimed: bool) -> Result<RunOutcome, SchedulerError> {
        if !claimed {
            return Ok(RunOutcome {
                triggered: false,
                message: format!("{} checks already running.", family.label()),
            });
        }

        let mut summary = ScanSummary::default();
        match family {
            Family::Servers => {
                for server in self.store.get_servers()? {
                    self.dispatch_server(&server, &mut summary);
                }
            }
            Family::Shortcuts => {
                for shortcut in self.store.get_shortcuts()? {
                    if shortcut.monitor_enabled {
                        summary.record(self.dispatcher.dispatch(Job::Shortcut(shortcut.id)));
                    }
                }
            }
        }
        tracing::info!("{} checks triggered manually: {:?}", family.label(), summary);

        Ok(RunOutcome {
            triggered: true,
            message: format!("{} checks triggered.", family.label()),
        })
    }

    // --- Flags ---

    /// Flip a boolean setting (unset counts as enabled) and return the new value.
    pub fn toggle(&self, flag_key: &str) -> Result<bool, SchedulerError> {
        let enabled = self.settings.toggle_setting(flag_key, true)?;
        tracing::info!("{} set to {}", flag_key, enabled);
        Ok(enabled)
    }

    /// Turn the periodic scan for `family` on or off.
    pub fn set_checks_enabled(&self, family: Family, enabled: bool) -> Result<(), SchedulerError> {
        self.settings
            .set_setting(family.enabled_key(), if enabled { "true" } else { "false" })?;
        tracing::info!("{} set to {}", family.enabled_key(), enabled);
        Ok(())
    }

    /// Whether the periodic scan for `family` is enabled.
    pub fn checks_enabled(&self, family: Family) -> Result<bool, SchedulerError> {
        Ok(self.settings.setting_enabled(family.enabled_key(), true)?)
    }

    // --- On-demand checks ---

    /// Ping and collect metrics for one server, waiting for both.
    pub async fn check_server_now(&self, id: i64) -> Result<Server, SchedulerError> {
        self.store.get_server(id)?;

        let (ping, metrics) = tokio::join!(self.monitor.ping_server(id), self.monitor.collect_metrics(id));
        ping?;
        metrics?;

        Ok(self.store.get_server(id)?)
    }

    /// Check one shortcut now, regardless of flags and due state.
    pub async fn check_shortcut_now(&self, id: i64) -> Result<Shortcut, SchedulerError> {
        self.monitor.check_shortcut(id).await?;
        Ok(self.store.get_shortcut(id)?)
    }

    /// Refresh a server's extended metrics, or return the cached copy on failure.
    pub async fn fetch_extended_metrics(&self, id: i64) -> Option<serde_json::Value> {
        self.monitor.refresh_extended_metrics(id).await
    }

    // --- Retention ---

    /// Delete samples past the retention horizon.
    pub fn prune_samples(&self) -> Result<usize, SchedulerError> {
        Ok(prune_metric_samples(&self.store, Utc::now())?)
    }
}
