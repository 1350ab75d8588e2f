//! Opsboard Notify - notification relay server
//!
//! Serves the notification API and, when an upstream source is configured,
//! polls it in the background so alerts are stored even when no operator has
//! the dashboard open.

use opsboard_notify::{
    background::BackgroundPoller, build_router, upstream::UpstreamClient, AppState, Config, Store,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Initialize structured logging
    init_tracing();

    // Load and validate configuration
    let config = Config::from_env();
    log_startup_info(&config);

    // Initialize core components
    let store = Arc::new(Store::new(&config));
    let mut state = AppState::new(store, &config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start background pollers
    match UpstreamClient::from_config(&config) {
        Ok(Some(upstream)) => {
            let poller = Arc::new(BackgroundPoller::new(
                &config,
                upstream.clone(),
                Arc::new(state.ingest.clone()),
                state.poll_errors.clone(),
            ));
            poller.clone().start(shutdown_rx);
            state = state.with_upstream(upstream).with_background(poller);
        }
        Ok(None) => info!("No upstream configured, background polling disabled"),
        Err(e) => warn!(error = %e, "Upstream client unavailable, background polling disabled"),
    }

    // Build and serve the application
    let app = build_router(state);
    serve(app, &config).await;

    let _ = shutdown_tx.send(true);
    info!("Server stopped");
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("opsboard_notify=debug,tower_http=info")),
        )
        .init();
}

/// Log startup configuration (no secrets).
fn log_startup_info(config: &Config) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        storage = "memory",
        schema_ready = config.schema_ready,
        upstream_enabled = config.upstream_configured(),
        ingest_key_required = config.ingest_api_key.is_some(),
        wake_interval_secs = config.background_wake_interval.as_secs(),
        fetch_timeout_secs = config.fetch_timeout.as_secs(),
        "Starting opsboard notification relay"
    );
}

/// Bind to address and serve the application until Ctrl-C.
async fn serve(app: axum::Router, config: &Config) {
    let bind_addr = format!("{}:{}", config.bind_addr, config.port);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .expect("Server error");
}
