//! # wire
//!
//! Wire protocol for the Cartrita MCP fabric: the message envelope and its
//! payloads, plus the binary codec (4-byte big-endian length prefix +
//! MessagePack body) spoken on every transport.
//!
//! The crate is pure data: no async runtime, no I/O. Transports wrap
//! [`FrameCodec`] into their own framing layers.
//!
//! Key types are re-exported at crate root:
//! `use wire::{Message, Body, TaskRequest, TaskResponse, ErrorCode, FrameCodec};`

mod agent;
mod codec;
mod context;
mod error;
mod message;
mod payload;

pub use agent::{AgentDescriptor, AgentTier, HealthState};
pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES, LEN_PREFIX_BYTES};
pub use context::{Budget, Delivery, Guarantee, ResourceLimits, TaskContext};
pub use error::{ErrorCode, WireError};
pub use message::{Body, Message, MessageType, ORCHESTRATOR_RECIPIENT};
pub use payload::{
    Event, ErrorPayload, StreamChunk, StreamEnd, StreamStart, TaskMetrics, TaskRequest,
    TaskResponse, TaskStatus, CANCEL_TASK_TYPE, EVENT_DEREGISTER, EVENT_HEALTH, EVENT_HEARTBEAT,
    EVENT_HELLO, EVENT_REGISTER,
};
