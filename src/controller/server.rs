use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{SharedState, api, ingress};

/// Reviewer API plus the worker's callback ingress, behind one listener.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .merge(ingress::ingress_router())
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the controller until `shutdown` resolves.
pub async fn start_server(
    addr: SocketAddr,
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind controller to {}", addr))?;
    info!(addr = %listener.local_addr()?, "Controller listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Controller server error")?;

    info!("Controller shut down");
    Ok(())
}
