//! Stackscope - server and bookmark monitoring engine
//!
//! Pings servers, collects agent metrics and checks shortcut URLs on a
//! schedule, and serves the results over a JSON API.

mod config;
mod db;
mod probe;
mod scheduler;
#[cfg(test)]
mod testutil;
mod web;

use config::ServerConfig;
use db::Store;
use scheduler::Scheduler;
use web::HttpServer;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("stackscope=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Stackscope on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(store.clone(), cfg.scheduler())?);
    scheduler.start();

    // Start web server
    let server = HttpServer::new(cfg, store, scheduler.clone());
    let result = server.start().await;

    scheduler.stop();
    result
}
