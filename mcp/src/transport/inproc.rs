//! In-process transport for co-located agents and tests: same
//! authentication and dispatch path as socket connections, minus the codec.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use wire::{Body, Event, Message, EVENT_REGISTER};

use super::hub::{ConnCtx, PeerKind, TransportHub};
use super::TransportError;

/// One side of an in-process connection. `recv` yields messages addressed to
/// this peer; `send` injects frames as if they arrived off the socket.
pub struct InProcessConn {
    peer_id: String,
    conn_id: u64,
    hub: Arc<TransportHub>,
    ctx: Mutex<ConnCtx>,
    outbound: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
}

/// Authenticates `first_frame` and attaches an in-process peer. The frame is
/// dispatched exactly like a socket handshake, so a `register` event lands
/// the agent in the registry.
pub async fn connect_in_process(
    hub: &Arc<TransportHub>,
    first_frame: Message,
) -> Result<InProcessConn, TransportError> {
    let principal = hub.gate().authenticate_first_frame(&first_frame)?;

    let peer_id = match &first_frame.body {
        Body::Event(Event { name, data }) if name == EVENT_REGISTER => data
            .get("agent_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&principal.subject)
            .to_string(),
        _ => principal.subject.clone(),
    };
    let kind = match &first_frame.body {
        Body::Event(Event { name, .. }) if name == EVENT_REGISTER => PeerKind::Agent,
        _ => PeerKind::Client,
    };

    let cancel = CancellationToken::new();
    let (outbound, conn_id) = hub.attach_peer(&peer_id, kind, cancel.clone());
    let mut ctx = ConnCtx {
        peer_id: peer_id.clone(),
        kind,
        principal,
        authorized: HashSet::new(),
    };
    hub.handle_inbound(&mut ctx, first_frame).await?;

    Ok(InProcessConn {
        peer_id,
        conn_id,
        hub: Arc::clone(hub),
        ctx: Mutex::new(ctx),
        outbound: Mutex::new(outbound),
        cancel,
    })
}

impl InProcessConn {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Injects one frame into the hub as this peer.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        msg.validate().map_err(TransportError::Wire)?;
        let mut ctx = self.ctx.lock().await;
        self.hub.handle_inbound(&mut ctx, msg).await
    }

    /// Next message addressed to this peer, or `None` once disconnected.
    pub async fn recv(&self) -> Option<Message> {
        let mut outbound = self.outbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = outbound.recv() => msg,
        }
    }

    /// Simulates connection loss: queues drop, pending responses fail with
    /// `AGENT_UNAVAILABLE`.
    pub fn disconnect(&self) {
        self.hub.connection_lost(&self.peer_id, self.conn_id);
    }
}
