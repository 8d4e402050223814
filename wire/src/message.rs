//! The message envelope: identity, correlation, tracing, addressing, and the
//! typed payload.
//!
//! `Serialize`/`Deserialize` are written by hand: the wire shape puts
//! `message_type` and `payload` at the top level of the envelope map, and the
//! payload's concrete type is driven by `message_type`. (A derived
//! `#[serde(flatten)]` would force unknown-length maps, which MessagePack
//! encoding rejects.) Unknown envelope fields are skipped on decode; an
//! unknown `message_type` fails the frame.

use chrono::{DateTime, Utc};
use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::context::{Delivery, TaskContext};
use crate::error::WireError;
use crate::payload::{
    ErrorPayload, Event, StreamChunk, StreamEnd, StreamStart, TaskRequest, TaskResponse,
};

/// Well-known recipient for client-originated traffic.
pub const ORCHESTRATOR_RECIPIENT: &str = "orchestrator";

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Message discriminator, mirrored on the wire as `message_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Event,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskResponse => "TASK_RESPONSE",
            MessageType::StreamStart => "STREAM_START",
            MessageType::StreamChunk => "STREAM_CHUNK",
            MessageType::StreamEnd => "STREAM_END",
            MessageType::Event => "EVENT",
            MessageType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Typed payload. On the wire this is the `message_type` + `payload` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    StreamStart(StreamStart),
    StreamChunk(StreamChunk),
    StreamEnd(StreamEnd),
    Event(Event),
    Error(ErrorPayload),
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::TaskRequest(_) => MessageType::TaskRequest,
            Body::TaskResponse(_) => MessageType::TaskResponse,
            Body::StreamStart(_) => MessageType::StreamStart,
            Body::StreamChunk(_) => MessageType::StreamChunk,
            Body::StreamEnd(_) => MessageType::StreamEnd,
            Body::Event(_) => MessageType::Event,
            Body::Error(_) => MessageType::Error,
        }
    }

    /// Rebuilds the typed payload from the wire pair.
    pub fn from_parts(message_type: MessageType, payload: Value) -> Result<Self, WireError> {
        let err = |e: serde_json::Error| {
            WireError::Schema(format!("payload does not match {}: {}", message_type, e))
        };
        Ok(match message_type {
            MessageType::TaskRequest => Body::TaskRequest(serde_json::from_value(payload).map_err(err)?),
            MessageType::TaskResponse => {
                Body::TaskResponse(serde_json::from_value(payload).map_err(err)?)
            }
            MessageType::StreamStart => {
                Body::StreamStart(serde_json::from_value(payload).map_err(err)?)
            }
            MessageType::StreamChunk => {
                Body::StreamChunk(serde_json::from_value(payload).map_err(err)?)
            }
            MessageType::StreamEnd => Body::StreamEnd(serde_json::from_value(payload).map_err(err)?),
            MessageType::Event => Body::Event(serde_json::from_value(payload).map_err(err)?),
            MessageType::Error => Body::Error(serde_json::from_value(payload).map_err(err)?),
        })
    }
}

/// The wire primitive. Everything the fabric moves is one of these.
///
/// `correlation_id` ties a request to its response(s) and to every chunk of a
/// stream; trace fields propagate across hops with a fresh span per hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub sender: String,
    pub recipient: String,
    pub body: Body,
    pub tags: Vec<String>,
    pub context: TaskContext,
    pub delivery: Delivery,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub security_token: Option<String>,
    pub permissions: Vec<String>,
}

impl Message {
    /// New message with fresh ids; `correlation_id` starts equal to `id` and
    /// is overridden for replies and chunks.
    pub fn new(body: Body) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            correlation_id: id,
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            sender: String::new(),
            recipient: String::new(),
            body,
            tags: Vec::new(),
            context: TaskContext::new(),
            delivery: Delivery::default(),
            created_at: now(),
            expires_at: None,
            security_token: None,
            permissions: Vec::new(),
        }
    }

    pub fn task_request(request: TaskRequest) -> Self {
        Self::new(Body::TaskRequest(request))
    }

    pub fn event(event: Event) -> Self {
        Self::new(Body::Event(event))
    }

    /// Reply envelope: addressed back to the sender, sharing the original
    /// correlation id and trace, with a fresh id and child span.
    pub fn reply_to(original: &Message, body: Body) -> Self {
        let mut msg = Self::new(body);
        msg.correlation_id = original.correlation_id;
        msg.trace_id = original.trace_id;
        msg.parent_span_id = Some(original.span_id);
        msg.recipient = original.sender.clone();
        msg.context = original.context.clone();
        msg
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = recipient.into();
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| at > exp).unwrap_or(false)
    }

    /// Schema checks beyond what the type system enforces. Violations map to
    /// `PROTOCOL_VIOLATION` and close the connection.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.delivery.priority > 9 {
            return Err(WireError::Schema(format!(
                "delivery.priority {} out of range 0-9",
                self.delivery.priority
            )));
        }
        if let Body::TaskRequest(ref req) = self.body {
            if req.task_type.is_empty() {
                return Err(WireError::Schema("task_type must not be empty".into()));
            }
            if req.priority > 9 {
                return Err(WireError::Schema(format!(
                    "priority {} out of range 0-9",
                    req.priority
                )));
            }
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at < self.created_at {
                return Err(WireError::Schema("expires_at precedes created_at".into()));
            }
        }
        Ok(())
    }
}

const FIELDS: &[&str] = &[
    "id",
    "correlation_id",
    "trace_id",
    "span_id",
    "parent_span_id",
    "sender",
    "recipient",
    "message_type",
    "payload",
    "tags",
    "context",
    "delivery",
    "created_at",
    "expires_at",
    "security_token",
    "permissions",
];

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Message", FIELDS.len())?;
        st.serialize_field("id", &self.id)?;
        st.serialize_field("correlation_id", &self.correlation_id)?;
        st.serialize_field("trace_id", &self.trace_id)?;
        st.serialize_field("span_id", &self.span_id)?;
        st.serialize_field("parent_span_id", &self.parent_span_id)?;
        st.serialize_field("sender", &self.sender)?;
        st.serialize_field("recipient", &self.recipient)?;
        st.serialize_field("message_type", &self.body.message_type())?;
        match &self.body {
            Body::TaskRequest(p) => st.serialize_field("payload", p)?,
            Body::TaskResponse(p) => st.serialize_field("payload", p)?,
            Body::StreamStart(p) => st.serialize_field("payload", p)?,
            Body::StreamChunk(p) => st.serialize_field("payload", p)?,
            Body::StreamEnd(p) => st.serialize_field("payload", p)?,
            Body::Event(p) => st.serialize_field("payload", p)?,
            Body::Error(p) => st.serialize_field("payload", p)?,
        }
        st.serialize_field("tags", &self.tags)?;
        st.serialize_field("context", &self.context)?;
        st.serialize_field("delivery", &self.delivery)?;
        st.serialize_field("created_at", &self.created_at)?;
        st.serialize_field("expires_at", &self.expires_at)?;
        st.serialize_field("security_token", &self.security_token)?;
        st.serialize_field("permissions", &self.permissions)?;
        st.end()
    }
}

struct MessageVisitor;

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("an MCP message map")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Message, A::Error> {
        let mut id: Option<Uuid> = None;
        let mut correlation_id: Option<Uuid> = None;
        let mut trace_id: Option<Uuid> = None;
        let mut span_id: Option<Uuid> = None;
        let mut parent_span_id: Option<Uuid> = None;
        let mut sender = String::new();
        let mut recipient = String::new();
        let mut message_type: Option<MessageType> = None;
        // Buffered until message_type is known; payloads are JSON-shaped.
        let mut payload: Option<Value> = None;
        let mut tags: Vec<String> = Vec::new();
        let mut context: Option<TaskContext> = None;
        let mut delivery: Option<Delivery> = None;
        let mut created_at: Option<DateTime<Utc>> = None;
        let mut expires_at: Option<DateTime<Utc>> = None;
        let mut security_token: Option<String> = None;
        let mut permissions: Vec<String> = Vec::new();

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "id" => id = Some(map.next_value()?),
                "correlation_id" => correlation_id = Some(map.next_value()?),
                "trace_id" => trace_id = Some(map.next_value()?),
                "span_id" => span_id = Some(map.next_value()?),
                "parent_span_id" => parent_span_id = map.next_value()?,
                "sender" => sender = map.next_value()?,
                "recipient" => recipient = map.next_value()?,
                "message_type" => message_type = Some(map.next_value()?),
                "payload" => payload = Some(map.next_value()?),
                "tags" => tags = map.next_value()?,
                "context" => context = Some(map.next_value()?),
                "delivery" => delivery = Some(map.next_value()?),
                "created_at" => created_at = Some(map.next_value()?),
                "expires_at" => expires_at = map.next_value()?,
                "security_token" => security_token = map.next_value()?,
                "permissions" => permissions = map.next_value()?,
                // Unknown envelope fields: tolerated for rolling upgrades.
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        let id = id.ok_or_else(|| de::Error::missing_field("id"))?;
        let message_type = message_type.ok_or_else(|| de::Error::missing_field("message_type"))?;
        let body = Body::from_parts(message_type, payload.unwrap_or(Value::Null))
            .map_err(de::Error::custom)?;

        Ok(Message {
            id,
            correlation_id: correlation_id.unwrap_or(id),
            trace_id: trace_id.unwrap_or_else(Uuid::new_v4),
            span_id: span_id.unwrap_or_else(Uuid::new_v4),
            parent_span_id,
            sender,
            recipient,
            body,
            tags,
            context: context.unwrap_or_default(),
            delivery: delivery.unwrap_or_default(),
            created_at: created_at.unwrap_or_else(now),
            expires_at,
            security_token,
            permissions,
        })
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_struct("Message", FIELDS, MessageVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{TaskRequest, TaskResponse};

    #[test]
    fn reply_shares_correlation_and_trace() {
        let req = Message::task_request(TaskRequest::new("echo", serde_json::json!({})))
            .with_sender("client-1");
        let resp = Message::reply_to(
            &req,
            Body::TaskResponse(TaskResponse::completed("t1", serde_json::json!("ok"))),
        );
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.trace_id, req.trace_id);
        assert_eq!(resp.parent_span_id, Some(req.span_id));
        assert_eq!(resp.recipient, "client-1");
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn message_type_tag_on_the_wire() {
        let msg = Message::task_request(TaskRequest::new("echo", serde_json::json!({})));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["message_type"], "TASK_REQUEST");
        assert_eq!(v["payload"]["task_type"], "echo");
    }

    #[test]
    fn json_round_trip() {
        let msg = Message::task_request(TaskRequest::new("echo", serde_json::json!({"n": 1})))
            .with_sender("client-1")
            .with_recipient(ORCHESTRATOR_RECIPIENT)
            .with_token("tok");
        let v = serde_json::to_value(&msg).unwrap();
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_message_type_rejected() {
        let msg = Message::task_request(TaskRequest::new("echo", serde_json::json!({})));
        let mut v = serde_json::to_value(&msg).unwrap();
        v["message_type"] = serde_json::json!("TELEPORT");
        assert!(serde_json::from_value::<Message>(v).is_err());
    }

    #[test]
    fn missing_correlation_defaults_to_id() {
        let msg = Message::task_request(TaskRequest::new("echo", serde_json::json!({})));
        let mut v = serde_json::to_value(&msg).unwrap();
        v.as_object_mut().unwrap().remove("correlation_id");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back.correlation_id, back.id);
    }

    #[test]
    fn out_of_range_priority_fails_validation() {
        let mut msg = Message::task_request(TaskRequest::new("echo", serde_json::json!({})));
        msg.delivery.priority = 10;
        assert!(msg.validate().is_err());
    }
}
