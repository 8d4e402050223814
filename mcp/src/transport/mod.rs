//! Transport: frame delivery between the orchestrator and its peers over a
//! Unix-domain-socket server and in-process channels.
//!
//! Every connection speaks the wire codec, authenticates its first frame
//! through the security gate, and runs the state machine
//! NEW → AUTH_PENDING → READY → DRAINING → CLOSED. Ordering is per-connection
//! FIFO in both directions; nothing is promised across connections.

mod codec;
mod connection;
mod hub;
mod inproc;
mod uds;

pub use codec::McpCodec;
pub use connection::drive_connection;
pub use hub::{ConnCtx, HubConfig, IngressTask, PeerKind, TransportHub};
pub use inproc::{connect_in_process, InProcessConn};
pub use uds::UdsServer;

use thiserror::Error;
use wire::{ErrorCode, WireError};

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unknown recipient '{0}'")]
    UnknownRecipient(String),
    #[error("outbound queue full for '{0}'")]
    Backpressure(String),
    #[error("connection to '{0}' is closed")]
    ConnectionClosed(String),
    #[error("agent '{0}' is draining and refuses new tasks")]
    Draining(String),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Io(_) => ErrorCode::AgentUnavailable,
            TransportError::Wire(e) => e.code(),
            TransportError::Auth(e) => e.code(),
            TransportError::UnknownRecipient(_) => ErrorCode::UnknownRecipient,
            TransportError::Backpressure(_) => ErrorCode::Backpressure,
            TransportError::ConnectionClosed(_) => ErrorCode::AgentUnavailable,
            TransportError::Draining(_) => ErrorCode::AgentUnavailable,
        }
    }

    /// True when the connection that produced this error must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        self.code().is_connection_fatal()
    }
}
