//! Type-specific message payloads: task request/response, stream frames,
//! events, and the error payload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Agent lifecycle events carried as `EVENT` payloads.
pub const EVENT_HELLO: &str = "hello";
pub const EVENT_REGISTER: &str = "register";
pub const EVENT_DEREGISTER: &str = "deregister";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_HEALTH: &str = "health";

/// Reserved task_type for best-effort cancellation of an in-flight task.
pub const CANCEL_TASK_TYPE: &str = "cancel";

fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_priority() -> u8 {
    5
}

/// A unit of work addressed at a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Domain tag the router matches against agent capabilities.
    pub task_type: String,
    /// Unique id; generated when the client omits it.
    #[serde(default = "new_task_id")]
    pub task_id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Routing hint; honored only when the agent is READY and capable.
    #[serde(default)]
    pub preferred_agent: Option<String>,
    /// 0–9, higher is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Absolute deadline for the whole task.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_type: task_type.into(),
            task_id: new_task_id(),
            parameters,
            metadata: HashMap::new(),
            preferred_agent: None,
            priority: default_priority(),
            deadline: None,
        }
    }

    pub fn with_preferred_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Terminal and non-terminal task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Execution counters the executor fills in before sealing a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub queue_time_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

/// Result of a task: either `result` or `error_message`/`error_code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub metrics: TaskMetrics,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TaskResponse {
    pub fn completed(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            error_message: None,
            error_code: None,
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error_message: Some(message.into()),
            error_code: Some(code),
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn cancelled(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            result: None,
            error_message: None,
            error_code: None,
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn timeout(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Timeout,
            result: None,
            error_message: Some("task deadline elapsed".to_string()),
            error_code: Some(ErrorCode::Timeout),
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Opens a chunk stream for a task. Chunks share the message correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    pub task_id: String,
}

/// One ordered fragment of a streamed result. `sequence` starts at 0 and
/// increases strictly by 1 as observed by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub sequence: u64,
    pub data: Value,
}

/// Terminates a stream; carries the terminal status and, on failure, the code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub metrics: TaskMetrics,
}

/// Out-of-band notification (registration, heartbeat, health, auth hello).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn heartbeat(agent_id: &str) -> Self {
        Self::new(EVENT_HEARTBEAT, serde_json::json!({ "agent_id": agent_id }))
    }
}

/// Protocol-level failure addressed back to a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub detail: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}
