//! Arrakis Redis - shard pool service
//!
//! Initializes the shard registry, exposes health/ready/metrics endpoints,
//! and tears the connections down in order on SIGINT/SIGTERM.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use arrakis_redis::health::{self, AppState};
use arrakis_redis::metrics::PoolMetrics;
use arrakis_redis::{ServerConfig, ShardRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = ServerConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_redis={}", config.log_level).parse()?)
                .add_directive("redis=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shards = config.shards.len(),
        "Starting Arrakis Redis pool"
    );

    let metrics = Arc::new(PoolMetrics::install()?);
    info!("Prometheus metrics initialized");

    let registry = Arc::new(ShardRegistry::new());
    registry.initialize(&config)?;

    let app_state = AppState {
        registry: Arc::clone(&registry),
        metrics: Some(Arc::clone(&metrics)),
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        health::router(app_state),
    );

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    registry.shutdown().await;

    info!("Arrakis Redis pool shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
