//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, FsUsage, MetricSample, Server, Shortcut};
use crate::scheduler::{Family, SchedulerError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_SAMPLE_LIMIT: i64 = 120;
const MAX_SAMPLE_LIMIT: i64 = 2000;

// ============================================================================
// Errors
// ============================================================================

/// Maps engine errors onto status codes: 422 for validation, 404 for missing rows.
#[derive(Debug)]
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError(e)
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        ApiError(SchedulerError::Db(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            SchedulerError::Db(DbError::NotFound) => (StatusCode::NOT_FOUND, "Not found").into_response(),
            SchedulerError::Db(e @ DbError::Invalid { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
            }
            e => {
                tracing::error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    "ok"
}

// ============================================================================
// API: Servers
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SampleView {
    #[serde(flatten)]
    pub sample: MetricSample,
    pub fs_usage: Vec<FsUsage>,
}

impl From<MetricSample> for SampleView {
    fn from(sample: MetricSample) -> Self {
        let fs_usage = sample.fs_usage();
        Self { sample, fs_usage }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: Server,
    pub latest_sample: Option<SampleView>,
}

fn server_view(state: &AppState, server: Server) -> ApiResult<ServerView> {
    let latest_sample = state.store.latest_metric_sample(server.id)?.map(SampleView::from);
    Ok(ServerView { server, latest_sample })
}

pub async fn handle_get_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerView>>> {
    let servers = state.store.get_servers()?;
    let views = servers
        .into_iter()
        .map(|s| server_view(&state, s))
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(views))
}

pub async fn handle_get_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServerView>> {
    let server = state.store.get_server(id)?;
    Ok(Json(server_view(&state, server)?))
}

#[derive(Debug, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub agent_url: Option<String>,
    /// Absent keeps the stored token on update; an empty string clears it.
    #[serde(default)]
    pub agent_token: Option<String>,
    #[serde(default)]
    pub ping_interval_seconds: Option<i64>,
}

impl ServerRequest {
    fn apply(self, server: &mut Server) {
        server.name = self.name;
        server.host = self.host;
        server.port = self.port;
        server.agent_url = self.agent_url.filter(|u| !u.trim().is_empty());
        if let Some(token) = self.agent_token {
            server.agent_token = Some(token).filter(|t| !t.trim().is_empty());
        }
        if let Some(interval) = self.ping_interval_seconds {
            server.ping_interval_seconds = interval;
        }
    }
}

pub async fn handle_create_server(
    State(state): State<AppState>,
    Json(req): Json<ServerRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut server = Server::default();
    req.apply(&mut server);
    state.store.add_server(&mut server)?;
    tracing::info!("Added server {} ({})", server.name, server.id);
    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn handle_update_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ServerRequest>,
) -> ApiResult<Json<Server>> {
    let mut server = state.store.get_server(id)?;
    req.apply(&mut server);
    state.store.update_server(&mut server)?;
    Ok(Json(server))
}

pub async fn handle_delete_server(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.store.delete_server(id)?;
    tracing::info!("Deleted server {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub ids: Vec<i64>,
}

pub async fn handle_reorder_servers(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<StatusCode> {
    state.store.reorder_servers(&req.ids)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_check_server_now(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServerView>> {
    let server = state.scheduler.check_server_now(id).await?;
    Ok(Json(server_view(&state, server)?))
}

#[derive(Debug, Serialize)]
pub struct ExtendedMetricsResponse {
    pub server_id: i64,
    pub extended_metrics: Option<serde_json::Value>,
    pub fetched_at: Option<DateTime<Utc>>,
}

pub async fn handle_extended_metrics(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ExtendedMetricsResponse>> {
    state.store.get_server(id)?;
    let extended_metrics = state.scheduler.fetch_extended_metrics(id).await;
    let fetched_at = state.store.get_server(id)?.extended_metrics_fetched_at;
    Ok(Json(ExtendedMetricsResponse {
        server_id: id,
        extended_metrics,
        fetched_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SamplesQuery {
    pub limit: Option<i64>,
}

pub async fn handle_get_samples(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<SamplesQuery>,
) -> ApiResult<Json<Vec<SampleView>>> {
    state.store.get_server(id)?;
    let limit = query.limit.unwrap_or(DEFAULT_SAMPLE_LIMIT).clamp(1, MAX_SAMPLE_LIMIT);
    let samples = state.store.get_metric_samples(id, limit)?;
    Ok(Json(samples.into_iter().map(SampleView::from).collect()))
}

// ============================================================================
// API: Shortcuts
// ============================================================================

pub async fn handle_get_shortcuts(State(state): State<AppState>) -> ApiResult<Json<Vec<Shortcut>>> {
    Ok(Json(state.store.get_shortcuts()?))
}

#[derive(Debug, Deserialize)]
pub struct ShortcutRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub monitor_enabled: Option<bool>,
    #[serde(default)]
    pub check_interval_seconds: Option<i64>,
    /// Honored on update; new shortcuts are appended.
    #[serde(default)]
    pub position: Option<i64>,
}

impl ShortcutRequest {
    fn apply(self, shortcut: &mut Shortcut) {
        shortcut.name = self.name;
        shortcut.url = self.url;
        shortcut.icon_url = self.icon_url.filter(|u| !u.trim().is_empty());
        shortcut.category = self.category.filter(|c| !c.trim().is_empty());
        if let Some(enabled) = self.monitor_enabled {
            shortcut.monitor_enabled = enabled;
        }
        if let Some(interval) = self.check_interval_seconds {
            shortcut.check_interval_seconds = interval;
        }
        if let Some(position) = self.position {
            shortcut.position = position;
        }
    }
}

pub async fn handle_create_shortcut(
    State(state): State<AppState>,
    Json(req): Json<ShortcutRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut shortcut = Shortcut::default();
    req.apply(&mut shortcut);
    state.store.add_shortcut(&mut shortcut)?;
    tracing::info!("Added shortcut {} ({})", shortcut.name, shortcut.id);
    Ok((StatusCode::CREATED, Json(shortcut)))
}

pub async fn handle_update_shortcut(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ShortcutRequest>,
) -> ApiResult<Json<Shortcut>> {
    let mut shortcut = state.store.get_shortcut(id)?;
    req.apply(&mut shortcut);
    state.store.update_shortcut(&mut shortcut)?;
    Ok(Json(shortcut))
}

pub async fn handle_delete_shortcut(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.store.delete_shortcut(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_reorder_shortcuts(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<StatusCode> {
    state.store.reorder_shortcuts(&req.ids)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_check_shortcut_now(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Shortcut>> {
    Ok(Json(state.scheduler.check_shortcut_now(id).await?))
}

// ============================================================================
// Monitoring controls
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitoringStatus {
    pub servers_checks_enabled: bool,
    pub shortcuts_checks_enabled: bool,
}

pub async fn handle_monitoring_status(State(state): State<AppState>) -> ApiResult<Json<MonitoringStatus>> {
    Ok(Json(MonitoringStatus {
        servers_checks_enabled: state.scheduler.checks_enabled(Family::Servers)?,
        shortcuts_checks_enabled: state.scheduler.checks_enabled(Family::Shortcuts)?,
    }))
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub key: &'static str,
    pub enabled: bool,
}

fn toggle_family(state: &AppState, family: Family) -> ApiResult<Json<ToggleResponse>> {
    let key = family.enabled_key();
    let enabled = state.scheduler.toggle(key)?;
    Ok(Json(ToggleResponse { key, enabled }))
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

fn set_family(state: &AppState, family: Family, enabled: bool) -> ApiResult<Json<ToggleResponse>> {
    state.scheduler.set_checks_enabled(family, enabled)?;
    Ok(Json(ToggleResponse {
        key: family.enabled_key(),
        enabled,
    }))
}

pub async fn handle_set_servers_enabled(
    State(state): State<AppState>,
    Json(req): Json<EnabledRequest>,
) -> ApiResult<Json<ToggleResponse>> {
    set_family(&state, Family::Servers, req.enabled)
}

pub async fn handle_set_shortcuts_enabled(
    State(state): State<AppState>,
    Json(req): Json<EnabledRequest>,
) -> ApiResult<Json<ToggleResponse>> {
    set_family(&state, Family::Shortcuts, req.enabled)
}

pub async fn handle_toggle_servers(State(state): State<AppState>) -> ApiResult<Json<ToggleResponse>> {
    toggle_family(&state, Family::Servers)
}

pub async fn handle_toggle_shortcuts(State(state): State<AppState>) -> ApiResult<Json<ToggleResponse>> {
    toggle_family(&state, Family::Shortcuts)
}

pub async fn handle_run_servers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.run_servers_now()?))
}

pub async fn handle_run_shortcuts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.run_shortcuts_now()?))
}
