//! Per-request supervisor state: an immutable value, replaced on every hop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel for graph exit in `next_agent`.
pub const END: &str = "__end__";

/// Transcript role of the supervisor.
pub const SUPERVISOR_ROLE: &str = "supervisor";

/// Transcript role of the originating user turn.
pub const USER_ROLE: &str = "user";

/// One transcript entry: who produced it and what they said.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `supervisor`, or a sub-agent id.
    pub role: String,
    pub content: Value,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: Value) -> Self {
        Self {
            role: role.into(),
            content,
        }
    }
}

/// What one hop contributes: transcript entries, tools used, and writes into
/// the acting agent's private namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub private_state: HashMap<String, Value>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.tools_used.is_empty() && self.private_state.is_empty()
    }
}

/// Request-scoped graph state. Never mutated in place: [`TurnState::apply`]
/// composes a new value from the prior one and a hop's delta.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnState {
    pub request_id: String,
    pub user_id: Option<String>,
    /// Ordered transcript, append-only.
    pub messages: Vec<ChatMessage>,
    /// Per-agent opaque maps; namespace is the acting agent, merge is
    /// last-write-wins per key. No agent writes outside its namespace.
    pub private_state: HashMap<String, HashMap<String, Value>>,
    /// Append-only record of tools invoked across the request.
    pub tools_used: Vec<String>,
    /// Completed delegation hops.
    pub depth: u32,
    /// Set when the graph reached END; a sealed state accepts no more hops.
    pub sealed: bool,
}

impl TurnState {
    pub fn new(request_id: impl Into<String>, user_id: Option<String>, opening: ChatMessage) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
            messages: vec![opening],
            private_state: HashMap::new(),
            tools_used: Vec::new(),
            depth: 0,
            sealed: false,
        }
    }

    /// New state = prior state + delta: messages and tools concatenated,
    /// private writes merged last-write-wins into `namespace` only.
    pub fn apply(&self, namespace: &str, delta: &StateDelta) -> TurnState {
        let mut next = self.clone();
        next.messages.extend(delta.messages.iter().cloned());
        next.tools_used.extend(delta.tools_used.iter().cloned());
        if !delta.private_state.is_empty() {
            let ns = next.private_state.entry(namespace.to_string()).or_default();
            for (key, value) in &delta.private_state {
                ns.insert(key.clone(), value.clone());
            }
        }
        next
    }

    /// New state with one more completed delegation hop.
    pub fn advanced(&self) -> TurnState {
        let mut next = self.clone();
        next.depth += 1;
        next
    }

    pub fn sealed(&self) -> TurnState {
        let mut next = self.clone();
        next.sealed = true;
        next
    }

    /// Transcript as a JSON value, for response payloads.
    pub fn transcript(&self) -> Value {
        serde_json::to_value(&self.messages).unwrap_or(Value::Null)
    }
}
