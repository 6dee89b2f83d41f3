//! Metrics and health endpoints.

use crate::metrics::metrics_handler;
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn health_handler() -> &'static str {
    "OK"
}

pub fn make_app() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}

/// Serve [`make_app`] on `port` until `cancel` fires.
pub async fn run_metrics_server(port: u16, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}!", port);

    axum::serve(listener, make_app())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Metrics server stopped");
    Ok(())
}
