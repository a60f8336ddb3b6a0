//! Status HTTP server
//!
//! Exposes the current [`StatusSnapshot`] as JSON on `GET /status`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{SharedMetrics, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(metrics): State<SharedMetrics>) -> Json<StatusSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(metrics)
}

/// Serve the status endpoint on `listen` until `shutdown` is cancelled.
pub async fn run_status_server(
    listen: &str,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ServerError::InvalidAddress(listen.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status server listening");

    axum::serve(listener, create_status_router(metrics))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
