//! Supervisor decision parsing: the delegation sum type, parsed once at the
//! graph boundary.
//!
//! Invalid shapes fail closed into `Respond` with the raw payload as text,
//! so a confused supervisor degrades to answering instead of looping.

use serde_json::Value;

use super::state::StateDelta;

/// What the supervisor wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Answer the user; terminal.
    Respond { text: String },
    /// Hand a bounded task to a sub-agent, then return here.
    Delegate {
        agent_id: String,
        /// Capability for the sub-task; defaults to the request's task_type.
        task_type: Option<String>,
        /// Parameters for the sub-task; defaults to the transcript.
        parameters: Option<Value>,
    },
    /// Stop without a direct answer; terminal.
    End,
}

/// One parsed supervisor turn: the decision plus its state delta.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorTurn {
    pub decision: Decision,
    pub delta: StateDelta,
}

impl SupervisorTurn {
    /// Parses a supervisor result. Expected shape:
    ///
    /// ```json
    /// {
    ///   "action": "respond" | "delegate" | "end",
    ///   "text": "...",                   // respond
    ///   "agent_id": "...",               // delegate
    ///   "task_type": "...",              // delegate, optional
    ///   "parameters": { ... },           // delegate, optional
    ///   "messages": [ ... ],             // optional delta
    ///   "tools_used": [ ... ],           // optional delta
    ///   "private_state": { ... }         // optional delta
    /// }
    /// ```
    pub fn parse(result: Option<&Value>) -> Self {
        let Some(value) = result else {
            return Self {
                decision: Decision::End,
                delta: StateDelta::default(),
            };
        };
        let Some(obj) = value.as_object() else {
            return Self::fallback(value);
        };

        let delta = StateDelta {
            messages: obj
                .get("messages")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            tools_used: obj
                .get("tools_used")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            private_state: obj
                .get("private_state")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
        };

        let decision = match obj.get("action").and_then(Value::as_str) {
            Some("respond") => match obj.get("text").and_then(Value::as_str) {
                Some(text) => Decision::Respond {
                    text: text.to_string(),
                },
                None => return Self::fallback(value),
            },
            Some("delegate") => match obj.get("agent_id").and_then(Value::as_str) {
                Some(agent_id) => Decision::Delegate {
                    agent_id: agent_id.to_string(),
                    task_type: obj
                        .get("task_type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    parameters: obj.get("parameters").cloned(),
                },
                None => return Self::fallback(value),
            },
            Some("end") => Decision::End,
            _ => return Self::fallback(value),
        };

        Self { decision, delta }
    }

    /// Fail-closed default: treat the whole payload as a textual answer.
    fn fallback(value: &Value) -> Self {
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        Self {
            decision: Decision::Respond { text },
            delta: StateDelta::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn respond_parses() {
        let turn = SupervisorTurn::parse(Some(&json!({"action": "respond", "text": "done"})));
        assert_eq!(
            turn.decision,
            Decision::Respond {
                text: "done".into()
            }
        );
    }

    #[test]
    fn delegate_parses_with_optional_fields() {
        let turn = SupervisorTurn::parse(Some(&json!({
            "action": "delegate",
            "agent_id": "vision-1",
            "task_type": "vision",
            "parameters": {"image": "ref-1"},
            "tools_used": ["planner"]
        })));
        assert_eq!(
            turn.decision,
            Decision::Delegate {
                agent_id: "vision-1".into(),
                task_type: Some("vision".into()),
                parameters: Some(json!({"image": "ref-1"})),
            }
        );
        assert_eq!(turn.delta.tools_used, vec!["planner".to_string()]);
    }

    #[test]
    fn end_parses() {
        let turn = SupervisorTurn::parse(Some(&json!({"action": "end"})));
        assert_eq!(turn.decision, Decision::End);
    }

    #[test]
    fn missing_result_is_end() {
        let turn = SupervisorTurn::parse(None);
        assert_eq!(turn.decision, Decision::End);
    }

    #[test]
    fn malformed_shapes_fail_closed_to_respond() {
        // Unknown action.
        let turn = SupervisorTurn::parse(Some(&json!({"action": "teleport"})));
        assert!(matches!(turn.decision, Decision::Respond { .. }));

        // Delegate without a target.
        let turn = SupervisorTurn::parse(Some(&json!({"action": "delegate"})));
        assert!(matches!(turn.decision, Decision::Respond { .. }));

        // Respond without text.
        let turn = SupervisorTurn::parse(Some(&json!({"action": "respond"})));
        assert!(matches!(turn.decision, Decision::Respond { .. }));

        // Bare string.
        let turn = SupervisorTurn::parse(Some(&json!("just words")));
        assert_eq!(
            turn.decision,
            Decision::Respond {
                text: "just words".into()
            }
        );
    }

    #[test]
    fn delta_fields_with_wrong_types_are_dropped_not_fatal() {
        let turn = SupervisorTurn::parse(Some(&json!({
            "action": "end",
            "messages": "not-an-array",
            "tools_used": 7
        })));
        assert_eq!(turn.decision, Decision::End);
        assert!(turn.delta.is_empty());
    }
}
