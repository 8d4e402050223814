//! HTTP/WebSocket ingress for the MCP orchestrator (axum + ws).
//!
//! A thin adapter: JSON bodies map onto the wire model with identical
//! snake_case field names, and streaming is surfaced as the same `STREAM_*`
//! messages serialized as JSON over the WebSocket.
//!
//! - `POST /v1/tasks` — submit `{task_type, parameters, context?, delivery?}`
//!   and get the sealed response.
//! - `GET /v1/ws` — duplex channel: each client frame is one ingress
//!   request, each server frame one outgoing message.
//! - `GET /healthz` — liveness.

mod app;
mod connection;
mod protocol;

pub use app::{app, AppState};
pub use protocol::{ClientFrame, ServerFrame, SubmitBody};

use std::net::SocketAddr;
use std::sync::Arc;

use mcp::Orchestrator;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("serve: {0}")]
    Serve(std::io::Error),
}

/// Binds `addr` and serves the ingress until the orchestrator shuts down.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    tracing::info!(%addr, "ingress listening");
    axum::serve(listener, app(orchestrator))
        .await
        .map_err(ServeError::Serve)
}
