//! Graph runner: drives supervisor turns and delegated sub-tasks until the
//! request terminates.
//!
//! Termination: supervisor END or Respond, budget exceeded, deadline, depth
//! cap, cancellation, or a fatal hop error. Whatever the exit, the response
//! carries the transcript accumulated so far.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use wire::{ErrorCode, TaskMetrics, TaskRequest, TaskResponse, TaskStatus};

use crate::context::RequestContext;

use super::decision::{Decision, SupervisorTurn};
use super::state::{ChatMessage, StateDelta, TurnState, SUPERVISOR_ROLE, USER_ROLE};

#[derive(Debug, Error)]
pub enum HopError {
    #[error("{code}: {message}")]
    Failed { code: ErrorCode, message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl HopError {
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        HopError::Failed {
            code,
            message: message.into(),
        }
    }
}

/// Executes one hop against a real agent. Implemented by the task executor;
/// tests substitute scripted drivers.
#[async_trait]
pub trait HopDriver: Send + Sync {
    /// One supervisor turn over the current state.
    async fn supervisor_turn(
        &self,
        state: &TurnState,
        rctx: &RequestContext,
    ) -> Result<TaskResponse, HopError>;

    /// One delegated sub-task; control returns to the supervisor afterwards.
    async fn sub_task(
        &self,
        agent_id: &str,
        task_type: Option<&str>,
        parameters: Option<&Value>,
        state: &TurnState,
        rctx: &RequestContext,
    ) -> Result<TaskResponse, HopError>;
}

/// Terminal result of a graph run.
#[derive(Debug)]
pub struct GraphOutcome {
    pub response: TaskResponse,
    pub state: TurnState,
}

/// Runs the supervisor star graph for one request.
pub struct GraphRunner {
    max_depth: u32,
}

impl GraphRunner {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    pub async fn run(
        &self,
        driver: &dyn HopDriver,
        request: &TaskRequest,
        rctx: &RequestContext,
    ) -> GraphOutcome {
        let mut state = TurnState::new(
            rctx.task.request_id.clone(),
            rctx.task.user_id.clone(),
            ChatMessage::new(USER_ROLE, request.parameters.clone()),
        );
        let mut warnings: Vec<String> = Vec::new();
        let mut metrics = TaskMetrics::default();

        loop {
            if rctx.is_cancelled() {
                return self.cancelled(request, state, metrics);
            }
            if rctx.deadline_passed() {
                return self.failed(
                    request,
                    state,
                    metrics,
                    warnings,
                    ErrorCode::Timeout,
                    "request deadline elapsed",
                );
            }

            let sup_resp = match driver.supervisor_turn(&state, rctx).await {
                Ok(resp) => resp,
                Err(HopError::Cancelled) => return self.cancelled(request, state, metrics),
                Err(HopError::Failed { code, message }) => {
                    return self.failed(request, state, metrics, warnings, code, message)
                }
            };
            accumulate(&mut metrics, &sup_resp.metrics);
            warnings.extend(sup_resp.warnings.iter().cloned());

            // A supervisor that failed its own turn is a fatal error
            // propagated up, not a decision to parse.
            match sup_resp.status {
                TaskStatus::Cancelled => return self.cancelled(request, state, metrics),
                TaskStatus::Failed | TaskStatus::Timeout => {
                    let code = sup_resp.error_code.unwrap_or(ErrorCode::Internal);
                    let message = sup_resp
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "supervisor turn failed".to_string());
                    return self.failed(request, state, metrics, warnings, code, message);
                }
                TaskStatus::Pending | TaskStatus::Running | TaskStatus::Completed => {}
            }

            let turn = SupervisorTurn::parse(sup_resp.result.as_ref());
            state = state.apply(SUPERVISOR_ROLE, &turn.delta);

            match turn.decision {
                Decision::Respond { text } => {
                    if turn.delta.messages.is_empty() {
                        let delta = StateDelta {
                            messages: vec![ChatMessage::new(
                                SUPERVISOR_ROLE,
                                json!({ "text": text.clone() }),
                            )],
                            ..Default::default()
                        };
                        state = state.apply(SUPERVISOR_ROLE, &delta);
                    }
                    state = state.sealed();
                    let mut response = TaskResponse::completed(
                        request.task_id.clone(),
                        json!({ "text": text, "transcript": state.transcript() }),
                    );
                    response.metrics = metrics;
                    response.warnings = warnings;
                    return GraphOutcome { response, state };
                }
                Decision::End => {
                    state = state.sealed();
                    let mut response = TaskResponse::completed(
                        request.task_id.clone(),
                        json!({ "transcript": state.transcript() }),
                    );
                    response.metrics = metrics;
                    response.warnings = warnings;
                    return GraphOutcome { response, state };
                }
                Decision::Delegate {
                    agent_id,
                    task_type,
                    parameters,
                } => {
                    if state.depth >= self.max_depth {
                        warnings.push(format!(
                            "{}: delegation depth {} reached; forcing END",
                            ErrorCode::DepthExceeded,
                            self.max_depth
                        ));
                        state = state.sealed();
                        let mut response = TaskResponse::completed(
                            request.task_id.clone(),
                            json!({ "transcript": state.transcript() }),
                        );
                        response.metrics = metrics;
                        response.warnings = warnings;
                        return GraphOutcome { response, state };
                    }
                    if rctx.is_cancelled() {
                        return self.cancelled(request, state, metrics);
                    }

                    let sub_resp = match driver
                        .sub_task(
                            &agent_id,
                            task_type.as_deref(),
                            parameters.as_ref(),
                            &state,
                            rctx,
                        )
                        .await
                    {
                        Ok(resp) => resp,
                        Err(HopError::Cancelled) => {
                            return self.cancelled(request, state, metrics)
                        }
                        Err(HopError::Failed { code, message }) => {
                            return self.failed(request, state, metrics, warnings, code, message)
                        }
                    };
                    accumulate(&mut metrics, &sub_resp.metrics);
                    warnings.extend(sub_resp.warnings.iter().cloned());
                    state = state.apply(&agent_id, &sub_delta(&agent_id, &sub_resp)).advanced();
                }
            }
        }
    }

    fn cancelled(
        &self,
        request: &TaskRequest,
        state: TurnState,
        metrics: TaskMetrics,
    ) -> GraphOutcome {
        let state = state.sealed();
        let mut response = TaskResponse::cancelled(request.task_id.clone());
        response.result = Some(json!({ "transcript": state.transcript() }));
        response.metrics = metrics;
        GraphOutcome { response, state }
    }

    fn failed(
        &self,
        request: &TaskRequest,
        state: TurnState,
        metrics: TaskMetrics,
        warnings: Vec<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> GraphOutcome {
        let state = state.sealed();
        let mut response = TaskResponse::failed(request.task_id.clone(), code, message);
        response.result = Some(json!({ "transcript": state.transcript() }));
        response.metrics = metrics;
        response.warnings = warnings;
        GraphOutcome { response, state }
    }
}

fn accumulate(total: &mut TaskMetrics, hop: &TaskMetrics) {
    total.cost_usd += hop.cost_usd;
    total.tokens_used += hop.tokens_used;
    total.retry_count += hop.retry_count;
    total.processing_time_ms += hop.processing_time_ms;
    total.queue_time_ms += hop.queue_time_ms;
    if hop.model_used.is_some() {
        total.model_used = hop.model_used.clone();
    }
}

/// Turns a sub-agent response into its state delta: one transcript entry,
/// plus any tools/private-state the result object carries.
fn sub_delta(agent_id: &str, resp: &TaskResponse) -> StateDelta {
    let content = match (&resp.result, resp.status) {
        (Some(result), _) => result.clone(),
        (None, TaskStatus::Completed) => Value::Null,
        (None, _) => json!({
            "error": resp.error_message.clone().unwrap_or_default(),
            "error_code": resp.error_code.map(|c| c.as_str()),
        }),
    };
    let mut delta = StateDelta {
        messages: vec![ChatMessage::new(agent_id, content)],
        ..Default::default()
    };
    if let Some(obj) = resp.result.as_ref().and_then(Value::as_object) {
        if let Some(tools) = obj.get("tools_used").and_then(|v| {
            serde_json::from_value::<Vec<String>>(v.clone()).ok()
        }) {
            delta.tools_used = tools;
        }
        if let Some(private) = obj.get("private_state").and_then(|v| {
            serde_json::from_value::<std::collections::HashMap<String, Value>>(v.clone()).ok()
        }) {
            delta.private_state = private;
        }
    }
    delta
}
