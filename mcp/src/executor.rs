//! Task executor: one logical owner per task, from routing through the
//! terminal response.
//!
//! The owner routes, sends, and awaits either a TASK_RESPONSE or a
//! STREAM_START/…/STREAM_END chain on the task's correlation id. Retries
//! follow the delivery contract with exponential backoff; EXACTLY_ONCE
//! deduplicates through the opaque store; cancellation sends a best-effort
//! `cancel` and frees the pending entry after a grace period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use wire::{
    AgentTier, Body, ErrorCode, Guarantee, Message, StreamChunk, StreamEnd, StreamStart,
    TaskRequest, TaskResponse, TaskStatus, CANCEL_TASK_TYPE, ORCHESTRATOR_RECIPIENT,
};

use crate::budget::RateKey;
use crate::budget::RateLimiter;
use crate::context::RequestContext;
use crate::graph::HopError;
use crate::registry::AgentEntry;
use crate::router::{RouteError, Router};
use crate::store::{StateStore, IDEMPOTENCY_TTL};
use crate::stream::ReassemblyBuffer;
use crate::transport::TransportHub;

/// Stream frames forwarded to a consumer while a task streams.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Start(StreamStart),
    Chunk(StreamChunk),
    End(StreamEnd),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Task timeout when neither the context nor the agent caps it.
    pub default_timeout: Duration,
    /// Retry backoff ceiling.
    pub backoff_cap: Duration,
    /// How long a cancelled task's pending entry lingers for stragglers.
    pub cancel_grace: Duration,
    /// Out-of-order window of the stream reassembly buffer.
    pub stream_window: u64,
    /// Bound of the per-task response queue.
    pub response_queue: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
            stream_window: 64,
            response_queue: 64,
        }
    }
}

enum Outcome {
    Terminal(TaskResponse),
    Retry { code: ErrorCode, detail: String },
    Cancelled,
}

/// Issues tasks to agents and owns their lifecycle.
pub struct TaskExecutor {
    hub: Arc<TransportHub>,
    router: Arc<Router>,
    store: Arc<dyn StateStore>,
    rate: Arc<RateLimiter>,
    cfg: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        hub: Arc<TransportHub>,
        router: Arc<Router>,
        store: Arc<dyn StateStore>,
        rate: Arc<RateLimiter>,
        cfg: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            router,
            store,
            rate,
            cfg,
        })
    }

    /// Runs one task to its terminal response. `chunk_sink`, when given,
    /// receives stream frames in order as they reassemble; without it the
    /// stream is aggregated into the response result.
    pub async fn run_task(
        &self,
        req: &TaskRequest,
        rctx: &RequestContext,
        tier: Option<AgentTier>,
        chunk_sink: Option<&mpsc::Sender<StreamItem>>,
    ) -> Result<TaskResponse, HopError> {
        let started = Instant::now();
        let idem_key = format!("idem:{}", req.task_id);

        if rctx.delivery.guarantee == Guarantee::ExactlyOnce {
            if let Some(resp) = self.idempotent_replay(&idem_key).await {
                tracing::debug!(task_id = %req.task_id, "idempotency cache hit");
                return Ok(resp);
            }
        }

        let mut attempt: u32 = 0;
        let mut queue_time = Duration::ZERO;

        loop {
            if rctx.is_cancelled() {
                return Err(HopError::Cancelled);
            }

            let route_started = Instant::now();
            let agent = match self
                .router
                .select_or_wait(req, &rctx.task, tier, &rctx.budget, rctx.deadline, &rctx.cancel)
                .await
            {
                Ok(agent) => agent,
                Err(RouteError::Cancelled) => return Err(HopError::Cancelled),
                Err(e) => return Err(HopError::failed(e.code(), e.to_string())),
            };
            queue_time += route_started.elapsed();

            if let Err(e) = self.rate.check(RateKey::Agent(agent.agent_id().to_string())) {
                self.router.release(&agent);
                return Err(HopError::failed(e.code(), e.to_string()));
            }

            let timeout = rctx.effective_timeout(
                agent
                    .descriptor
                    .resource_limits
                    .as_ref()
                    .and_then(|l| l.max_processing_time_ms),
                self.cfg.default_timeout,
            );
            let deadline_at = Instant::now() + timeout;

            let msg = self.build_request(req, rctx, agent.agent_id(), timeout);
            let correlation_id = msg.correlation_id;
            let (tx, mut rx) = mpsc::channel(self.cfg.response_queue);
            self.hub.register_pending(correlation_id, agent.agent_id(), tx);

            tracing::debug!(task_id = %req.task_id, agent_id = %agent.agent_id(),
                attempt, %correlation_id, "dispatching task");

            if let Err(e) = self.hub.publish_with_deadline(msg, Some(deadline_at)).await {
                self.hub.remove_pending(&correlation_id);
                self.router.release(&agent);
                let code = e.code();
                if self.retryable(rctx, attempt, code) {
                    attempt += 1;
                    if self.backoff(rctx, attempt).await.is_err() {
                        return Err(HopError::Cancelled);
                    }
                    continue;
                }
                return Err(HopError::failed(code, e.to_string()));
            }

            let outcome = self
                .await_outcome(req, &mut rx, deadline_at, rctx, chunk_sink)
                .await;

            match outcome {
                Outcome::Terminal(mut resp) => {
                    self.hub.remove_pending(&correlation_id);
                    self.router.release(&agent);

                    if let Err(e) = self.enforce_tool_allow_list(&agent, &resp) {
                        return Err(e);
                    }

                    if let Err(e) = rctx.budget.charge(
                        resp.metrics.model_used.as_deref(),
                        resp.metrics.cost_usd,
                        resp.metrics.tokens_used,
                    ) {
                        // Recorded but over the ceiling: admission blocks the
                        // next dispatch before new work is emitted.
                        resp.warnings.push(format!("{}: {e}", ErrorCode::BudgetExceeded));
                    }

                    resp.metrics.retry_count = attempt;
                    resp.metrics.queue_time_ms = queue_time.as_millis() as u64;
                    resp.metrics.processing_time_ms = started.elapsed().as_millis() as u64;

                    if rctx.delivery.guarantee == Guarantee::ExactlyOnce
                        && resp.status == TaskStatus::Completed
                    {
                        self.remember_result(&idem_key, &resp).await;
                    }
                    return Ok(resp);
                }
                Outcome::Retry { code, detail } => {
                    self.hub.remove_pending(&correlation_id);
                    self.router.release(&agent);
                    if self.retryable(rctx, attempt, code) {
                        tracing::debug!(task_id = %req.task_id, %code, attempt, "retrying task");
                        attempt += 1;
                        if self.backoff(rctx, attempt).await.is_err() {
                            return Err(HopError::Cancelled);
                        }
                        continue;
                    }
                    return Err(HopError::failed(code, detail));
                }
                Outcome::Cancelled => {
                    self.cancel_in_flight(req, rctx, &agent, correlation_id).await;
                    return Err(HopError::Cancelled);
                }
            }
        }
    }

    /// Sub-agents may only invoke tools on their allow-list. A violation
    /// fails the task with `PERMISSION_DENIED` and counts toward the misuse
    /// threshold; past it the registry marks the agent UNHEALTHY.
    fn enforce_tool_allow_list(
        &self,
        agent: &Arc<AgentEntry>,
        resp: &TaskResponse,
    ) -> Result<(), HopError> {
        if agent.descriptor.tier != AgentTier::Sub {
            return Ok(());
        }
        let Some(tools) = resp
            .result
            .as_ref()
            .and_then(|r| r.get("tools_used"))
            .and_then(Value::as_array)
        else {
            return Ok(());
        };
        let gate = self.hub.gate();
        for tool in tools.iter().filter_map(Value::as_str) {
            if let Err(e) = gate.authorize_tool(&agent.descriptor, tool) {
                if gate.misuse_exceeded(agent.agent_id()) {
                    tracing::warn!(agent_id = %agent.agent_id(),
                        "misuse threshold crossed; marking unhealthy");
                    let _ = self
                        .hub
                        .registry()
                        .set_health(agent.agent_id(), wire::HealthState::Unhealthy);
                }
                return Err(HopError::failed(e.code(), e.to_string()));
            }
        }
        Ok(())
    }

    async fn idempotent_replay(&self, idem_key: &str) -> Option<TaskResponse> {
        let bytes = self.store.get(idem_key).await.ok()??;
        serde_json::from_slice(&bytes).ok()
    }

    async fn remember_result(&self, idem_key: &str, resp: &TaskResponse) {
        match serde_json::to_vec(resp) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(idem_key, bytes, Some(IDEMPOTENCY_TTL)).await {
                    tracing::warn!(error = %e, "idempotency cache write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "idempotency cache encode failed"),
        }
    }

    fn build_request(
        &self,
        req: &TaskRequest,
        rctx: &RequestContext,
        agent_id: &str,
        timeout: Duration,
    ) -> Message {
        let trace = rctx.trace.child();
        let mut context = rctx.task.clone();
        context.budget = rctx.budget.snapshot();
        let mut msg = Message::task_request(req.clone())
            .with_sender(ORCHESTRATOR_RECIPIENT)
            .with_recipient(agent_id)
            .with_context(context)
            .with_delivery(rctx.delivery.clone());
        trace.apply(&mut msg);
        let ttl = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        msg.expires_at = Some(chrono::Utc::now() + ttl);
        msg
    }

    /// Drains the response channel until a terminal outcome: a terminal
    /// TASK_RESPONSE, a reassembled stream, a retryable fault, the deadline,
    /// or cancellation.
    async fn await_outcome(
        &self,
        req: &TaskRequest,
        rx: &mut mpsc::Receiver<Message>,
        deadline_at: Instant,
        rctx: &RequestContext,
        chunk_sink: Option<&mpsc::Sender<StreamItem>>,
    ) -> Outcome {
        let deadline = tokio::time::Instant::from_std(deadline_at);
        let mut stream: Option<(ReassemblyBuffer, Vec<Value>)> = None;

        loop {
            let inbound = tokio::select! {
                _ = rctx.cancel.cancelled() => {
                    // An open stream still terminates with a STREAM_END.
                    if stream.is_some() {
                        if let Some(sink) = chunk_sink {
                            let _ = sink
                                .send(StreamItem::End(StreamEnd {
                                    task_id: req.task_id.clone(),
                                    status: TaskStatus::Cancelled,
                                    error_code: None,
                                    metrics: Default::default(),
                                }))
                                .await;
                        }
                    }
                    return Outcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return if let Some((_, collected)) = stream {
                        // A stream died mid-flight: no retry, partial data out.
                        self.fail_stream(req, collected, ErrorCode::Timeout, chunk_sink).await
                    } else {
                        Outcome::Retry {
                            code: ErrorCode::Timeout,
                            detail: "no response before deadline".into(),
                        }
                    };
                }
                inbound = rx.recv() => inbound,
            };
            let Some(msg) = inbound else {
                return Outcome::Retry {
                    code: ErrorCode::AgentUnavailable,
                    detail: "response channel closed".into(),
                };
            };

            match msg.body {
                Body::TaskResponse(resp) if resp.status.is_terminal() => {
                    return Outcome::Terminal(resp);
                }
                Body::TaskResponse(_) => {
                    // PENDING/RUNNING progress; keep waiting.
                }
                Body::StreamStart(start) => {
                    if stream.is_some() {
                        tracing::warn!(task_id = %req.task_id, "duplicate STREAM_START dropped");
                        continue;
                    }
                    if let Some(sink) = chunk_sink {
                        let _ = sink.send(StreamItem::Start(start)).await;
                    }
                    stream = Some((ReassemblyBuffer::new(self.cfg.stream_window), Vec::new()));
                }
                Body::StreamChunk(chunk) => {
                    let Some((buffer, collected)) = stream.as_mut() else {
                        tracing::warn!(task_id = %req.task_id, "chunk before STREAM_START dropped");
                        continue;
                    };
                    match buffer.accept(chunk.sequence, chunk.data) {
                        Ok(ready) => {
                            for (sequence, data) in ready {
                                if let Some(sink) = chunk_sink {
                                    let _ = sink
                                        .send(StreamItem::Chunk(StreamChunk {
                                            sequence,
                                            data: data.clone(),
                                        }))
                                        .await;
                                }
                                collected.push(data);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %req.task_id, error = %e, "stream gap");
                            let collected = stream.take().map(|(_, c)| c).unwrap_or_default();
                            return self
                                .fail_stream(req, collected, ErrorCode::StreamGap, chunk_sink)
                                .await;
                        }
                    }
                }
                Body::StreamEnd(end) => {
                    let Some((mut buffer, collected)) = stream.take() else {
                        tracing::warn!(task_id = %req.task_id, "STREAM_END without start dropped");
                        continue;
                    };
                    if buffer.close().is_err() {
                        return self
                            .fail_stream(req, collected, ErrorCode::StreamGap, chunk_sink)
                            .await;
                    }
                    if let Some(sink) = chunk_sink {
                        let _ = sink.send(StreamItem::End(end.clone())).await;
                    }
                    let mut resp = TaskResponse {
                        task_id: end.task_id,
                        status: end.status,
                        result: Some(Value::Array(collected)),
                        error_message: None,
                        error_code: end.error_code,
                        metrics: end.metrics,
                        warnings: Vec::new(),
                    };
                    if resp.status == TaskStatus::Failed && resp.error_message.is_none() {
                        resp.error_message = resp.error_code.map(|c| c.to_string());
                    }
                    return Outcome::Terminal(resp);
                }
                Body::Error(err) => {
                    if matches!(err.code, ErrorCode::AgentUnavailable | ErrorCode::Timeout)
                        && stream.is_none()
                    {
                        return Outcome::Retry {
                            code: err.code,
                            detail: err.detail,
                        };
                    }
                    let collected = stream.take().map(|(_, c)| c).unwrap_or_default();
                    if !collected.is_empty() {
                        return self.fail_stream(req, collected, err.code, chunk_sink).await;
                    }
                    return Outcome::Terminal(TaskResponse::failed(
                        req.task_id.clone(),
                        err.code,
                        err.detail,
                    ));
                }
                Body::TaskRequest(_) | Body::Event(_) => {
                    tracing::warn!(task_id = %req.task_id, "unexpected frame on response channel");
                }
            }
        }
    }

    /// Emits the failed STREAM_END (partial results already went out) and
    /// produces the terminal failed response.
    async fn fail_stream(
        &self,
        req: &TaskRequest,
        collected: Vec<Value>,
        code: ErrorCode,
        chunk_sink: Option<&mpsc::Sender<StreamItem>>,
    ) -> Outcome {
        if let Some(sink) = chunk_sink {
            let _ = sink
                .send(StreamItem::End(StreamEnd {
                    task_id: req.task_id.clone(),
                    status: TaskStatus::Failed,
                    error_code: Some(code),
                    metrics: Default::default(),
                }))
                .await;
        }
        let mut resp = TaskResponse::failed(req.task_id.clone(), code, code.to_string());
        resp.result = Some(Value::Array(collected));
        Outcome::Terminal(resp)
    }

    fn retryable(&self, rctx: &RequestContext, attempt: u32, code: ErrorCode) -> bool {
        if rctx.delivery.guarantee == Guarantee::AtMostOnce {
            return false;
        }
        if attempt >= rctx.delivery.retry_count {
            return false;
        }
        matches!(
            code,
            ErrorCode::Timeout
                | ErrorCode::AgentUnavailable
                | ErrorCode::Backpressure
                | ErrorCode::UnknownRecipient
        )
    }

    /// Exponential backoff from `retry_delay_ms`, doubling per attempt and
    /// capped. Interrupted by cancellation.
    async fn backoff(&self, rctx: &RequestContext, attempt: u32) -> Result<(), ()> {
        let base = rctx.delivery.retry_delay_ms.max(1);
        let exp = attempt.saturating_sub(1).min(16);
        let delay = Duration::from_millis(base.saturating_mul(1u64 << exp))
            .min(self.cfg.backoff_cap);
        tokio::select! {
            _ = rctx.cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Best-effort cancel to the agent; the pending entry and the agent's
    /// slot are freed after the grace period regardless of acknowledgement.
    async fn cancel_in_flight(
        &self,
        req: &TaskRequest,
        rctx: &RequestContext,
        agent: &Arc<AgentEntry>,
        correlation_id: uuid::Uuid,
    ) {
        tracing::debug!(task_id = %req.task_id, agent_id = %agent.agent_id(), "cancelling in-flight task");
        let cancel_req = TaskRequest::new(
            CANCEL_TASK_TYPE,
            json!({ "task_id": req.task_id }),
        );
        let mut msg = Message::task_request(cancel_req)
            .with_sender(ORCHESTRATOR_RECIPIENT)
            .with_recipient(agent.agent_id());
        rctx.trace.child().apply(&mut msg);
        if let Err(e) = self.hub.publish(msg).await {
            tracing::debug!(error = %e, "cancel message not delivered");
        }

        let hub = Arc::clone(&self.hub);
        let router = Arc::clone(&self.router);
        let agent = Arc::clone(agent);
        let grace = self.cfg.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.remove_pending(&correlation_id);
            router.release(&agent);
        });
    }
}
