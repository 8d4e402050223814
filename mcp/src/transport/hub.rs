//! Transport hub: routes frames by recipient, dispatches inbound traffic,
//! and owns the pending-response table.
//!
//! Outbound sends apply backpressure: a full per-connection queue suspends
//! the producer until capacity frees or its deadline elapses. Connection
//! loss synthesizes `AGENT_UNAVAILABLE` errors for every response still
//! outstanding against that peer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wire::{
    AgentDescriptor, Body, ErrorCode, ErrorPayload, Event, HealthState, Message, TaskResponse,
    CANCEL_TASK_TYPE, EVENT_DEREGISTER, EVENT_HEALTH, EVENT_HEARTBEAT, EVENT_HELLO,
    EVENT_REGISTER, ORCHESTRATOR_RECIPIENT,
};

use crate::auth::{Principal, SecurityGate};
use crate::registry::Registry;

use super::TransportError;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_frame_bytes: usize,
    /// Bound of each per-connection outbound queue.
    pub outbound_queue: usize,
    /// Default send deadline when the producer has none of its own.
    pub send_timeout: Duration,
    /// How long a fresh connection may take to present its first frame.
    pub auth_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: wire::DEFAULT_MAX_FRAME_BYTES,
            outbound_queue: 64,
            send_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// What kind of peer sits on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Agent,
    Client,
}

/// Per-connection authorization state, owned by the connection driver.
pub struct ConnCtx {
    pub peer_id: String,
    pub kind: PeerKind,
    pub principal: Principal,
    /// Capabilities already verified on this connection (lazy re-verify).
    pub authorized: HashSet<String>,
}

struct PeerHandle {
    /// Distinguishes this connection from a replacement under the same id.
    conn_id: u64,
    kind: PeerKind,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    draining: AtomicBool,
}

struct PendingRoute {
    agent_id: String,
    tx: mpsc::Sender<Message>,
}

/// A client TASK_REQUEST that arrived over the transport, with the peer to
/// answer to.
#[derive(Debug)]
pub struct IngressTask {
    pub reply_to: String,
    pub message: Message,
}

/// Routes messages between connections, the executor, and the registry.
pub struct TransportHub {
    cfg: HubConfig,
    registry: Arc<Registry>,
    gate: Arc<SecurityGate>,
    peers: DashMap<String, Arc<PeerHandle>>,
    pending: DashMap<Uuid, PendingRoute>,
    ingress_tx: mpsc::Sender<IngressTask>,
    conn_seq: AtomicU64,
}

impl TransportHub {
    /// Builds the hub; the receiver carries client task requests to the
    /// orchestrator's ingress loop.
    pub fn new(
        registry: Arc<Registry>,
        gate: Arc<SecurityGate>,
        cfg: HubConfig,
    ) -> (Arc<Self>, mpsc::Receiver<IngressTask>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(cfg.outbound_queue);
        (
            Arc::new(Self {
                cfg,
                registry,
                gate,
                peers: DashMap::new(),
                pending: DashMap::new(),
                ingress_tx,
                conn_seq: AtomicU64::new(0),
            }),
            ingress_rx,
        )
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Attaches an authenticated peer; returns the outbound queue feeding
    /// its connection writer plus the connection id for teardown. A fresh
    /// connection under a taken id displaces the old one.
    pub(crate) fn attach_peer(
        &self,
        peer_id: &str,
        kind: PeerKind,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Message>, u64) {
        let conn_id = self.conn_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.cfg.outbound_queue);
        let handle = Arc::new(PeerHandle {
            conn_id,
            kind,
            outbound: tx,
            cancel,
            draining: AtomicBool::new(false),
        });
        if let Some(old) = self.peers.insert(peer_id.to_string(), handle) {
            old.cancel.cancel();
        }
        tracing::debug!(peer_id = %peer_id, ?kind, conn_id, "peer attached");
        (rx, conn_id)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Marks a peer DRAINING: in-flight work completes, new TASK_REQUESTs
    /// are refused.
    pub fn set_draining(&self, peer_id: &str) {
        if let Some(peer) = self.peers.get(peer_id) {
            peer.draining.store(true, Ordering::SeqCst);
        }
    }

    /// Registers interest in responses for `correlation_id` issued against
    /// `agent_id`.
    pub fn register_pending(&self, correlation_id: Uuid, agent_id: &str, tx: mpsc::Sender<Message>) {
        self.pending.insert(
            correlation_id,
            PendingRoute {
                agent_id: agent_id.to_string(),
                tx,
            },
        );
    }

    pub fn remove_pending(&self, correlation_id: &Uuid) {
        self.pending.remove(correlation_id);
    }

    /// Routes a message to its recipient's connection. Suspends under
    /// backpressure until queue capacity frees or `deadline` elapses.
    pub async fn publish(&self, msg: Message) -> Result<(), TransportError> {
        self.publish_with_deadline(msg, None).await
    }

    pub async fn publish_with_deadline(
        &self,
        msg: Message,
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        let recipient = msg.recipient.clone();
        let peer = self
            .peers
            .get(&recipient)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| TransportError::UnknownRecipient(recipient.clone()))?;

        if peer.draining.load(Ordering::SeqCst) {
            if let Body::TaskRequest(ref req) = msg.body {
                if req.task_type != CANCEL_TASK_TYPE {
                    return Err(TransportError::Draining(recipient));
                }
            }
        }

        let timeout = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(self.cfg.send_timeout);
        match tokio::time::timeout(timeout, peer.outbound.send(msg)).await {
            Err(_) => Err(TransportError::Backpressure(recipient)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed(recipient)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Dispatches one inbound frame from an authenticated connection.
    /// Errors returned here are connection-fatal; recoverable conditions are
    /// answered in-band with ERROR frames.
    pub(crate) async fn handle_inbound(
        &self,
        ctx: &mut ConnCtx,
        msg: Message,
    ) -> Result<(), TransportError> {
        match &msg.body {
            Body::Event(event) => self.handle_event(ctx, &msg, event.clone()).await,
            Body::TaskRequest(req) => {
                if msg.recipient != ORCHESTRATOR_RECIPIENT && !msg.recipient.is_empty() {
                    self.reply_error(
                        ctx,
                        &msg,
                        ErrorCode::UnknownRecipient,
                        format!("tasks are submitted to '{}'", ORCHESTRATOR_RECIPIENT),
                    )
                    .await;
                    return Ok(());
                }
                // Lazy re-verification when this connection first uses the
                // capability.
                if let Err(e) =
                    self.gate
                        .authorize_capability(&msg, &mut ctx.authorized, &req.task_type)
                {
                    tracing::warn!(peer_id = %ctx.peer_id, task_type = %req.task_type,
                        error = %e, "capability denied");
                    let reply = Message::reply_to(
                        &msg,
                        Body::TaskResponse(TaskResponse::failed(
                            req.task_id.clone(),
                            e.code(),
                            e.to_string(),
                        )),
                    )
                    .with_sender(ORCHESTRATOR_RECIPIENT);
                    let _ = self.publish(reply.with_recipient(ctx.peer_id.clone())).await;
                    return Ok(());
                }
                let task = IngressTask {
                    reply_to: ctx.peer_id.clone(),
                    message: msg,
                };
                if self.ingress_tx.send(task).await.is_err() {
                    tracing::error!("ingress channel closed; dropping task request");
                }
                Ok(())
            }
            Body::TaskResponse(_) | Body::StreamStart(_) | Body::StreamChunk(_)
            | Body::StreamEnd(_) | Body::Error(_) => {
                self.route_to_pending(ctx, msg).await;
                Ok(())
            }
        }
    }

    async fn handle_event(
        &self,
        ctx: &mut ConnCtx,
        msg: &Message,
        event: Event,
    ) -> Result<(), TransportError> {
        match event.name.as_str() {
            EVENT_HELLO => Ok(()),
            EVENT_REGISTER => {
                let descriptor: AgentDescriptor = match serde_json::from_value(event.data.clone()) {
                    Ok(d) => d,
                    Err(e) => {
                        self.reply_error(
                            ctx,
                            msg,
                            ErrorCode::ProtocolViolation,
                            format!("register event carries no valid descriptor: {e}"),
                        )
                        .await;
                        return Ok(());
                    }
                };
                // The credential's subject must own the agent id it registers.
                if descriptor.agent_id != ctx.principal.subject {
                    self.reply_error(
                        ctx,
                        msg,
                        ErrorCode::PermissionDenied,
                        format!(
                            "token subject '{}' cannot register agent '{}'",
                            ctx.principal.subject, descriptor.agent_id
                        ),
                    )
                    .await;
                    return Ok(());
                }
                if let Err(e) = self.registry.register(descriptor) {
                    self.reply_error(ctx, msg, ErrorCode::ProtocolViolation, e.to_string())
                        .await;
                }
                Ok(())
            }
            EVENT_DEREGISTER => {
                self.set_draining(&ctx.peer_id);
                if let Err(e) = self.registry.deregister(&ctx.peer_id) {
                    tracing::debug!(peer_id = %ctx.peer_id, error = %e, "deregister ignored");
                }
                Ok(())
            }
            EVENT_HEARTBEAT => {
                if let Err(e) = self.registry.heartbeat(&ctx.peer_id) {
                    tracing::debug!(peer_id = %ctx.peer_id, error = %e, "heartbeat ignored");
                }
                Ok(())
            }
            EVENT_HEALTH => {
                let state = event
                    .data
                    .get("state")
                    .cloned()
                    .unwrap_or(Value::Null);
                match serde_json::from_value::<HealthState>(state) {
                    Ok(health) => {
                        if health == HealthState::Draining {
                            self.set_draining(&ctx.peer_id);
                        }
                        if let Err(e) = self.registry.set_health(&ctx.peer_id, health) {
                            tracing::debug!(peer_id = %ctx.peer_id, error = %e, "health ignored");
                        }
                    }
                    Err(e) => {
                        self.reply_error(
                            ctx,
                            msg,
                            ErrorCode::ProtocolViolation,
                            format!("health event carries no valid state: {e}"),
                        )
                        .await;
                    }
                }
                Ok(())
            }
            other => {
                tracing::debug!(peer_id = %ctx.peer_id, event = %other, "unrecognized event ignored");
                Ok(())
            }
        }
    }

    /// Forwards a response-side frame to whoever awaits its correlation id.
    /// Frames with no pending entry are duplicates past their terminal
    /// response; they are dropped.
    async fn route_to_pending(&self, ctx: &ConnCtx, msg: Message) {
        let correlation_id = msg.correlation_id;
        let Some(route) = self.pending.get(&correlation_id).map(|r| r.tx.clone()) else {
            tracing::debug!(peer_id = %ctx.peer_id, %correlation_id,
                message_type = %msg.message_type(), "no pending entry; dropping frame");
            return;
        };
        if tokio::time::timeout(self.cfg.send_timeout, route.send(msg))
            .await
            .is_err()
        {
            tracing::warn!(%correlation_id, "pending consumer backlogged; frame dropped");
        }
    }

    async fn reply_error(&self, ctx: &ConnCtx, original: &Message, code: ErrorCode, detail: String) {
        tracing::warn!(peer_id = %ctx.peer_id, %code, detail = %detail, "replying with error");
        let reply = Message::reply_to(original, Body::Error(ErrorPayload::new(code, detail)))
            .with_sender(ORCHESTRATOR_RECIPIENT)
            .with_recipient(ctx.peer_id.clone());
        let _ = self.publish(reply).await;
    }

    /// Tears down a peer: discards its queues, deregisters agents, and fails
    /// every outstanding response against it with `AGENT_UNAVAILABLE`.
    /// A stale `conn_id` (the connection was already displaced) is a no-op.
    pub fn connection_lost(&self, peer_id: &str, conn_id: u64) {
        let Some((_, peer)) = self
            .peers
            .remove_if(peer_id, |_, handle| handle.conn_id == conn_id)
        else {
            return;
        };
        peer.cancel.cancel();
        tracing::info!(peer_id = %peer_id, "connection lost");

        if peer.kind == PeerKind::Agent {
            if let Err(e) = self.registry.deregister(peer_id) {
                tracing::debug!(peer_id = %peer_id, error = %e, "deregister on loss ignored");
            }
        }

        let stranded: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.agent_id == peer_id)
            .map(|entry| *entry.key())
            .collect();
        for correlation_id in stranded {
            if let Some((_, route)) = self.pending.remove(&correlation_id) {
                let synthetic = Message::new(Body::Error(ErrorPayload::new(
                    ErrorCode::AgentUnavailable,
                    format!("agent '{}' disconnected", peer_id),
                )))
                .with_sender(peer_id.to_string())
                .with_recipient(ORCHESTRATOR_RECIPIENT)
                .with_correlation(correlation_id);
                // try_send: the owner may already be gone; that is fine.
                let _ = route.tx.try_send(synthetic);
            }
        }
    }
}
