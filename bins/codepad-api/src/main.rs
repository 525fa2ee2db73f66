mod config;
mod error;
mod handlers;
mod metrics;
mod routes;

use codepad_common::config::BrokerConfig;
use codepad_common::connection;
use config::ApiConfig;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Codepad API booting...");

    let config = ApiConfig::from_env().map_err(|e| {
        error!("Invalid API configuration: {}", e);
        e
    })?;

    // The connection is created lazily and shared; a broker that is down at
    // boot only degrades submissions to 503 until it comes back.
    match connection::shared(&config.broker).await {
        Ok(_) => info!("Connected to Redis: {}", config.broker.redis_url),
        Err(e) => warn!(error = %e, "Redis unavailable at start-up; will retry per request"),
    }

    let state = Arc::new(AppState {
        broker: config.broker.clone(),
    });

    let app = routes::routes().with_state(state);

    let listener = TcpListener::bind(config.addr).await?;
    info!("HTTP server listening on {}", config.addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal");
}
