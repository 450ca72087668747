//! Web server module: a JSON surface over the registry and the scheduler.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
}

/// HTTP server for the dashboard API.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/up", get(handlers::handle_health))
            // Servers
            .route(
                "/api/servers",
                get(handlers::handle_get_servers).post(handlers::handle_create_server),
            )
            .route("/api/servers/reorder", post(handlers::handle_reorder_servers))
            .route(
                "/api/servers/{id}",
                get(handlers::handle_get_server)
                    .put(handlers::handle_update_server)
                    .delete(handlers::handle_delete_server),
            )
            .route("/api/servers/{id}/check_now", post(handlers::handle_check_server_now))
            .route(
                "/api/servers/{id}/extended_metrics",
                get(handlers::handle_extended_metrics),
            )
            .route("/api/servers/{id}/samples", get(handlers::handle_get_samples))
            // Shortcuts
            .route(
                "/api/shortcuts",
                get(handlers::handle_get_shortcuts).post(handlers::handle_create_shortcut),
            )
            .route("/api/shortcuts/reorder", post(handlers::handle_reorder_shortcuts))
            .route(
                "/api/shortcuts/{id}",
                put(handlers::handle_update_shortcut).delete(handlers::handle_delete_shortcut),
            )
            .route("/api/shortcuts/{id}/check_now", post(handlers::handle_check_shortcut_now))
            // Monitoring controls
            .route("/monitoring/status", get(handlers::handle_monitoring_status))
            .route("/monitoring/servers/toggle", post(handlers::handle_toggle_servers))
            .route("/monitoring/servers/enabled", put(handlers::handle_set_servers_enabled))
            .route("/monitoring/servers/run", post(handlers::handle_run_servers))
            .route("/monitoring/shortcuts/toggle", post(handlers::handle_toggle_shortcuts))
            .route("/monitoring/shortcuts/enabled", put(handlers::handle_set_shortcuts_enabled))
            .route("/monitoring/shortcuts/run", post(handlers::handle_run_shortcuts))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
