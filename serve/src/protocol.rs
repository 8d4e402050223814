//! JSON shapes of the ingress: submit bodies and WebSocket frames.
//!
//! Field names are the wire model's snake_case names; the adapter adds
//! nothing of its own beyond the frame `type` tag.

use serde::{Deserialize, Serialize};
use wire::{Delivery, Message, TaskContext, TaskRequest};

/// Body of `POST /v1/tasks` and of a WebSocket `submit` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBody {
    #[serde(flatten)]
    pub request: TaskRequest,
    #[serde(default)]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub delivery: Option<Delivery>,
}

/// One client WebSocket frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Submit(SubmitBody),
    Cancel {
        request_id: String,
    },
    Ping {
        #[serde(default)]
        id: Option<u64>,
    },
}

/// One server WebSocket frame. Outcome messages are the wire `Message`
/// itself; the adapter only adds pong/error/cancelled frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message { message: Message },
    Pong { id: Option<u64> },
    Cancelled { request_id: String, found: bool },
    Error { error: String },
}
