//! Correlation and tracing context: trace/span identifiers propagated on
//! every hop.
//!
//! Contexts are immutable. Components derive a child context for outgoing
//! messages instead of mutating the inbound one.

use uuid::Uuid;
use wire::Message;

/// Trace position of one message: which trace it belongs to, its own span,
/// and the span it descends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
}

impl TraceContext {
    /// Fresh root context, used at ingress when the client supplied none.
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
        }
    }

    /// Context carried by an inbound message.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            trace_id: msg.trace_id,
            span_id: msg.span_id,
            parent_span_id: msg.parent_span_id,
        }
    }

    /// Child span for the next hop: same trace, fresh span, parented here.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
        }
    }

    /// Stamps an outgoing message with this context.
    pub fn apply(&self, msg: &mut Message) {
        msg.trace_id = self.trace_id;
        msg.span_id = self.span_id;
        msg.parent_span_id = self.parent_span_id;
    }
}
