//! Axum app: state, routes, and the POST surface.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp::Orchestrator;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use wire::{Body, Delivery, Message, TaskContext, TaskResponse};

use super::connection::handle_socket;
use super::protocol::SubmitBody;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Builds the ingress router.
pub fn app(orchestrator: Arc<Orchestrator>) -> Router {
    let state = Arc::new(AppState { orchestrator });
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/ws", get(ws_upgrade))
        .with_state(state)
}

pub(crate) fn unpack(body: SubmitBody) -> (wire::TaskRequest, TaskContext, Delivery) {
    let SubmitBody {
        request,
        context,
        delivery,
    } = body;
    (
        request,
        context.unwrap_or_else(TaskContext::new),
        delivery.unwrap_or_default(),
    )
}

/// `POST /v1/tasks`: submit and wait for the sealed response. A streamed
/// outcome is aggregated: chunk data in order, sealed by the STREAM_END.
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Response {
    let (request, context, delivery) = unpack(body);
    let rx = state.orchestrator.submit(request, context, delivery).await;
    let mut outcomes = ReceiverStream::new(rx);

    let mut chunks: Vec<Value> = Vec::new();
    while let Some(msg) = outcomes.next().await {
        match msg.body {
            Body::TaskResponse(_) => return Json(msg).into_response(),
            Body::StreamStart(_) => {}
            Body::StreamChunk(chunk) => chunks.push(chunk.data),
            Body::StreamEnd(end) => {
                let response = TaskResponse {
                    task_id: end.task_id.clone(),
                    status: end.status,
                    result: Some(Value::Array(chunks)),
                    error_message: end.error_code.map(|c| c.to_string()),
                    error_code: end.error_code,
                    metrics: end.metrics.clone(),
                    warnings: Vec::new(),
                };
                let sealed = Message::new(Body::TaskResponse(response))
                    .with_sender(wire::ORCHESTRATOR_RECIPIENT)
                    .with_correlation(msg.correlation_id);
                return Json(sealed).into_response();
            }
            _ => {}
        }
    }
    (
        StatusCode::BAD_GATEWAY,
        "request ended without a terminal response",
    )
        .into_response()
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
