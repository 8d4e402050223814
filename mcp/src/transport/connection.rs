//! Connection driver: one task per connection, owning both directions.
//!
//! State machine: NEW → AUTH_PENDING (first frame must authenticate) →
//! READY (frames flow) → DRAINING (peer refuses new work) → CLOSED. A single
//! select loop keeps per-connection FIFO in both directions.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use wire::{Body, ErrorPayload, Event, Message, EVENT_REGISTER};

use super::codec::McpCodec;
use super::hub::{ConnCtx, PeerKind, TransportHub};

/// Runs one connection to completion. Returns when the peer disconnects,
/// a fatal protocol error closes the stream, or the token is cancelled.
pub async fn drive_connection<S>(io: S, hub: Arc<TransportHub>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let codec = McpCodec::new(hub.config().max_frame_bytes);
    let mut framed = Framed::new(io, codec);

    // AUTH_PENDING: the first frame must be an event bearing a valid token.
    let first = match tokio::time::timeout(hub.config().auth_timeout, framed.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => {
            tracing::warn!(error = %e, "handshake frame rejected");
            let _ = framed
                .send(fatal_frame(ErrorPayload::new(e.code(), e.to_string())))
                .await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            let _ = framed
                .send(fatal_frame(ErrorPayload::new(
                    wire::ErrorCode::AuthRequired,
                    "no authentication frame before timeout",
                )))
                .await;
            return;
        }
    };

    let principal = match hub.gate().authenticate_first_frame(&first) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "authentication failed");
            let _ = framed
                .send(fatal_frame(ErrorPayload::new(e.code(), e.to_string())))
                .await;
            return;
        }
    };

    let (peer_id, kind) = identify_peer(&principal.subject, &first);
    let mut ctx = ConnCtx {
        peer_id: peer_id.clone(),
        kind,
        principal,
        authorized: HashSet::new(),
    };

    // READY: attach to the hub, process the handshake frame (it may carry
    // the registration), then pump both directions.
    let (mut outbound, conn_id) = hub.attach_peer(&peer_id, kind, cancel.clone());
    if let Err(e) = hub.handle_inbound(&mut ctx, first).await {
        tracing::warn!(peer_id = %peer_id, error = %e, "handshake dispatch failed");
        hub.connection_lost(&peer_id, conn_id);
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        tracing::warn!(peer_id = %peer_id, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(msg)) => {
                    if let Err(e) = hub.handle_inbound(&mut ctx, msg).await {
                        tracing::warn!(peer_id = %peer_id, error = %e, "inbound dispatch failed");
                        if e.is_connection_fatal() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    // PROTOCOL_VIOLATION / FRAME_TOO_LARGE close the
                    // connection; the peer may reconnect.
                    tracing::warn!(peer_id = %peer_id, error = %e, "frame rejected; closing");
                    let _ = framed
                        .send(fatal_frame(ErrorPayload::new(e.code(), e.to_string())))
                        .await;
                    break;
                }
                None => break,
            },
        }
    }

    hub.connection_lost(&peer_id, conn_id);
}

/// Agent connections announce themselves by registering in their first
/// frame; anything else is a client keyed by its token subject.
fn identify_peer(subject: &str, first: &Message) -> (String, PeerKind) {
    if let Body::Event(Event { name, data }) = &first.body {
        if name == EVENT_REGISTER {
            if let Some(agent_id) = data.get("agent_id").and_then(|v| v.as_str()) {
                return (agent_id.to_string(), PeerKind::Agent);
            }
        }
    }
    (subject.to_string(), PeerKind::Client)
}

fn fatal_frame(payload: ErrorPayload) -> Message {
    Message::new(Body::Error(payload)).with_sender(wire::ORCHESTRATOR_RECIPIENT)
}
