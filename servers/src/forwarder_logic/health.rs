//! # Liveness Endpoint
//!
//! `GET /health` answers `OK` while the process runs. It shares no state
//! with the forward loop and says nothing about historian or broker health.

use anyhow::Result;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub fn router() -> Router {
    Router::new().route("/health", get(health_handler))
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Binds `0.0.0.0:port` and serves until shutdown is broadcast.
pub async fn serve(port: u16, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    log::info!("Health endpoint live at http://{}/health", addr);
    serve_on(listener, shutdown_rx).await
}

pub async fn serve_on(listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}
