//! WebSocket connection lifecycle: recv loop, request dispatch, and a
//! single writer task so concurrent submissions interleave cleanly.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::app::{unpack, AppState};
use super::protocol::{ClientFrame, ServerFrame};

pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // One writer: submissions run concurrently, frames stay whole.
    let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(text) = writer_rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(res) = stream.next().await {
        let msg = match res {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ws read error (client closed?)");
                break;
            }
        };
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(f) => f,
            Err(e) => {
                send(&writer_tx, &ServerFrame::Error {
                    error: format!("parse error: {e}"),
                })
                .await;
                continue;
            }
        };

        match frame {
            ClientFrame::Ping { id } => {
                send(&writer_tx, &ServerFrame::Pong { id }).await;
            }
            ClientFrame::Cancel { request_id } => {
                let found = state.orchestrator.cancel_request(&request_id);
                send(&writer_tx, &ServerFrame::Cancelled { request_id, found }).await;
            }
            ClientFrame::Submit(body) => {
                let (request, context, delivery) = unpack(body);
                let mut rx = state.orchestrator.submit(request, context, delivery).await;
                let writer_tx = writer_tx.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        let frame = ServerFrame::Message { message };
                        match serde_json::to_string(&frame) {
                            Ok(text) => {
                                if writer_tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "outcome frame failed to serialize");
                                break;
                            }
                        }
                    }
                });
            }
        }
    }

    drop(writer_tx);
    let _ = writer.await;
}

async fn send(writer_tx: &mpsc::Sender<String>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = writer_tx.send(text).await;
        }
        Err(e) => tracing::error!(error = %e, "server frame failed to serialize"),
    }
}
