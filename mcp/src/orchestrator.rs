//! Orchestrator: wires the gate, registry, router, graph, and executor into
//! the message ingress.
//!
//! Every accepted TASK_REQUEST yields exactly one terminal outcome: a single
//! TASK_RESPONSE, or a STREAM_START/…/STREAM_END chain whose END is
//! terminal. Requests with a READY supervisor for their task_type run the
//! supervisor graph; otherwise the orchestrator degrades to one direct hop
//! against a capable agent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wire::{
    AgentTier, Body, Delivery, ErrorCode, Message, TaskContext, TaskRequest, TaskResponse,
    CANCEL_TASK_TYPE, ORCHESTRATOR_RECIPIENT,
};

use crate::auth::SecurityGate;
use crate::budget::{RateKey, RateLimiter};
use crate::config::OrchestratorConfig;
use crate::context::RequestContext;
use crate::executor::{StreamItem, TaskExecutor};
use crate::graph::{GraphRunner, HopDriver, HopError, TurnState};
use crate::registry::Registry;
use crate::router::Router;
use crate::store::{InMemoryStateStore, StateStore};
use crate::trace::TraceContext;
use crate::transport::{HubConfig, IngressTask, TransportError, TransportHub, UdsServer};

/// Tier-0 gateway: accepts tasks, runs them through the supervisor graph or
/// a direct hop, and streams outcomes back.
pub struct Orchestrator {
    cfg: OrchestratorConfig,
    registry: Arc<Registry>,
    router: Arc<Router>,
    gate: Arc<SecurityGate>,
    rate: Arc<RateLimiter>,
    store: Arc<dyn StateStore>,
    hub: Arc<TransportHub>,
    executor: Arc<TaskExecutor>,
    runner: GraphRunner,
    active: AtomicUsize,
    requests: DashMap<String, CancellationToken>,
    cancel_root: CancellationToken,
    ingress_rx: Mutex<Option<mpsc::Receiver<IngressTask>>>,
}

impl Orchestrator {
    pub fn new(cfg: OrchestratorConfig) -> Arc<Self> {
        Self::with_store(cfg, Arc::new(InMemoryStateStore::new()))
    }

    /// Wires the components with an external opaque store (idempotency keys,
    /// session blobs).
    pub fn with_store(cfg: OrchestratorConfig, store: Arc<dyn StateStore>) -> Arc<Self> {
        let registry = Registry::new(cfg.heartbeat_interval);
        let router = Router::new(Arc::clone(&registry), cfg.router.clone());
        let gate = Arc::new(SecurityGate::new(&cfg.auth_secret));
        let rate = Arc::new(RateLimiter::new(cfg.rate_limits.clone()));
        let hub_cfg = HubConfig {
            max_frame_bytes: cfg.max_frame_bytes,
            ..Default::default()
        };
        let (hub, ingress_rx) = TransportHub::new(Arc::clone(&registry), Arc::clone(&gate), hub_cfg);
        let executor = TaskExecutor::new(
            Arc::clone(&hub),
            Arc::clone(&router),
            Arc::clone(&store),
            Arc::clone(&rate),
            cfg.executor.clone(),
        );
        let runner = GraphRunner::new(cfg.max_depth);
        Arc::new(Self {
            registry,
            router,
            gate,
            rate,
            store,
            hub,
            executor,
            runner,
            active: AtomicUsize::new(0),
            requests: DashMap::new(),
            cancel_root: CancellationToken::new(),
            ingress_rx: Mutex::new(Some(ingress_rx)),
            cfg,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<TransportHub> {
        &self.hub
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Brings up the socket server, heartbeat monitor, and transport ingress
    /// loop. Bind failures surface here so the CLI can map them to its exit
    /// code.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let uds = UdsServer::bind(&self.cfg.socket_path)?;
        let hub = Arc::clone(&self.hub);
        let cancel = self.cancel_root.clone();
        let uds_task = tokio::spawn(async move { uds.run(hub, cancel).await });

        let monitor = self
            .registry
            .spawn_heartbeat_monitor(self.cancel_root.clone());

        let ingress = self.spawn_transport_ingress().await;
        Ok(vec![uds_task, monitor, ingress])
    }

    pub fn shutdown(&self) {
        self.cancel_root.cancel();
    }

    /// Submits one task; the receiver yields the outcome messages (one
    /// TASK_RESPONSE, or STREAM_START/…/STREAM_END).
    pub async fn submit(
        self: &Arc<Self>,
        req: TaskRequest,
        ctx: TaskContext,
        delivery: Delivery,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_request(req, ctx, delivery, Uuid::new_v4(), tx).await;
        });
        rx
    }

    /// Cancels a running request by id. True when the request was known.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        match self.requests.get(request_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_request(
        self: Arc<Self>,
        req: TaskRequest,
        ctx: TaskContext,
        delivery: Delivery,
        correlation_id: Uuid,
        out: mpsc::Sender<Message>,
    ) {
        if self.active.fetch_add(1, Ordering::SeqCst) >= self.cfg.max_concurrent {
            self.active.fetch_sub(1, Ordering::SeqCst);
            let resp = TaskResponse::failed(
                req.task_id.clone(),
                ErrorCode::Backpressure,
                "orchestrator at max concurrent requests",
            );
            let _ = out
                .send(self.response_message(resp, correlation_id, &TraceContext::root()))
                .await;
            return;
        }
        self.run_request_inner(req, ctx, delivery, correlation_id, out)
            .await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_request_inner(
        self: &Arc<Self>,
        req: TaskRequest,
        ctx: TaskContext,
        delivery: Delivery,
        correlation_id: Uuid,
        out: mpsc::Sender<Message>,
    ) {
        let trace = TraceContext::root();

        if let Some(resp) = self.rate_limited(&req, &ctx) {
            let _ = out.send(self.response_message(resp, correlation_id, &trace)).await;
            return;
        }

        let cancel = self.cancel_root.child_token();
        let request_id = ctx.request_id.clone();
        self.requests.insert(request_id.clone(), cancel.clone());

        let mut rctx = RequestContext::at_ingress(ctx, cancel)
            .with_trace(trace)
            .with_delivery(delivery);
        if let Some(deadline) = req.deadline {
            let remaining = (deadline - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            rctx = rctx.with_deadline(Instant::now() + remaining);
        }

        tracing::info!(request_id = %request_id, task_type = %req.task_type,
            trace_id = %rctx.trace.trace_id, "request accepted");

        let supervised = self
            .registry
            .snapshot()
            .is_routable(&req.task_type, Some(AgentTier::Supervisor));

        if supervised {
            let driver = ExecutorHopDriver {
                executor: Arc::clone(&self.executor),
                base: req.clone(),
            };
            let outcome = self.runner.run(&driver, &req, &rctx).await;
            let _ = out
                .send(self.response_message(outcome.response, correlation_id, &rctx.trace))
                .await;
        } else {
            self.run_direct(&req, &rctx, correlation_id, &out).await;
        }

        self.requests.remove(&request_id);
        tracing::info!(request_id = %request_id, "request settled");
    }

    /// Single-hop path: no supervisor covers the task_type, so the task goes
    /// straight to a capable agent, with stream passthrough.
    async fn run_direct(
        self: &Arc<Self>,
        req: &TaskRequest,
        rctx: &RequestContext,
        correlation_id: Uuid,
        out: &mpsc::Sender<Message>,
    ) {
        let (sink_tx, mut sink_rx) = mpsc::channel::<StreamItem>(64);
        let forwarder = {
            let out = out.clone();
            let trace = rctx.trace;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut terminal_sent = false;
                while let Some(item) = sink_rx.recv().await {
                    let body = match item {
                        StreamItem::Start(start) => Body::StreamStart(start),
                        StreamItem::Chunk(chunk) => Body::StreamChunk(chunk),
                        StreamItem::End(end) => {
                            terminal_sent = true;
                            Body::StreamEnd(end)
                        }
                    };
                    let msg = this.outcome_message(body, correlation_id, &trace);
                    if out.send(msg).await.is_err() {
                        break;
                    }
                }
                terminal_sent
            })
        };

        let result = self
            .executor
            .run_task(req, rctx, None, Some(&sink_tx))
            .await;
        drop(sink_tx);
        let streamed_terminal = forwarder.await.unwrap_or(false);

        match result {
            Ok(resp) => {
                // A terminal STREAM_END already answered the caller.
                if !streamed_terminal {
                    let _ = out
                        .send(self.response_message(resp, correlation_id, &rctx.trace))
                        .await;
                }
            }
            Err(HopError::Cancelled) => {
                // A cancelled stream already ended with STREAM_END(CANCELLED).
                if !streamed_terminal {
                    let resp = TaskResponse::cancelled(req.task_id.clone());
                    let _ = out
                        .send(self.response_message(resp, correlation_id, &rctx.trace))
                        .await;
                }
            }
            Err(HopError::Failed { code, message }) => {
                if !streamed_terminal {
                    let resp = TaskResponse::failed(req.task_id.clone(), code, message);
                    let _ = out
                        .send(self.response_message(resp, correlation_id, &rctx.trace))
                        .await;
                }
            }
        }
    }

    fn rate_limited(&self, req: &TaskRequest, ctx: &TaskContext) -> Option<TaskResponse> {
        let mut keys = Vec::new();
        if let Some(ref user) = ctx.user_id {
            keys.push(RateKey::User(user.clone()));
        }
        if let Some(ref session) = ctx.session_id {
            keys.push(RateKey::Session(session.clone()));
        }
        for key in keys {
            if let Err(e) = self.rate.check(key) {
                let retry_after_ms = match &e {
                    crate::budget::GuardError::RateLimited { retry_after_ms } => *retry_after_ms,
                    _ => 0,
                };
                let mut resp =
                    TaskResponse::failed(req.task_id.clone(), e.code(), e.to_string());
                resp.metrics
                    .custom
                    .insert("retry_after_ms".to_string(), retry_after_ms as f64);
                return Some(resp);
            }
        }
        None
    }

    fn response_message(
        &self,
        resp: TaskResponse,
        correlation_id: Uuid,
        trace: &TraceContext,
    ) -> Message {
        self.outcome_message(Body::TaskResponse(resp), correlation_id, trace)
    }

    fn outcome_message(&self, body: Body, correlation_id: Uuid, trace: &TraceContext) -> Message {
        let mut msg = Message::new(body)
            .with_sender(ORCHESTRATOR_RECIPIENT)
            .with_correlation(correlation_id);
        trace.child().apply(&mut msg);
        msg
    }

    /// Consumes TASK_REQUESTs arriving over the transport and answers on the
    /// submitting connection.
    async fn spawn_transport_ingress(self: &Arc<Self>) -> JoinHandle<()> {
        let mut ingress_rx = self
            .ingress_rx
            .lock()
            .await
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = this.cancel_root.cancelled() => break,
                    task = ingress_rx.recv() => match task {
                        Some(t) => t,
                        None => break,
                    },
                };
                this.handle_transport_task(task).await;
            }
        })
    }

    async fn handle_transport_task(self: &Arc<Self>, task: IngressTask) {
        let IngressTask { reply_to, message } = task;
        let Body::TaskRequest(req) = message.body.clone() else {
            return;
        };

        // Client-side cancellation arrives as a `cancel` task.
        if req.task_type == CANCEL_TASK_TYPE {
            let target = req
                .parameters
                .get("request_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let found = self.cancel_request(target);
            let resp = TaskResponse::completed(req.task_id, json!({ "cancelled": found }));
            let reply = Message::reply_to(&message, Body::TaskResponse(resp))
                .with_sender(ORCHESTRATOR_RECIPIENT)
                .with_recipient(reply_to);
            let _ = self.hub.publish(reply).await;
            return;
        }

        let ctx = message.context.clone();
        let delivery = message.delivery.clone();
        let correlation_id = message.correlation_id;
        let (tx, mut rx) = mpsc::channel(64);
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_request(req, ctx, delivery, correlation_id, tx).await;
            });
        }
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if hub
                    .publish(msg.with_recipient(reply_to.clone()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

/// Hop driver backed by the real executor: supervisor turns route to
/// SUPERVISOR-tier agents on the request's task_type, delegations to the
/// named sub-agent.
struct ExecutorHopDriver {
    executor: Arc<TaskExecutor>,
    base: TaskRequest,
}

#[async_trait]
impl HopDriver for ExecutorHopDriver {
    async fn supervisor_turn(
        &self,
        state: &TurnState,
        rctx: &RequestContext,
    ) -> Result<TaskResponse, HopError> {
        let req = TaskRequest::new(
            self.base.task_type.clone(),
            json!({
                "messages": state.transcript(),
                "depth": state.depth,
                "tools_used": state.tools_used,
            }),
        )
        .with_priority(self.base.priority);
        self.executor
            .run_task(&req, rctx, Some(AgentTier::Supervisor), None)
            .await
    }

    async fn sub_task(
        &self,
        agent_id: &str,
        task_type: Option<&str>,
        parameters: Option<&Value>,
        state: &TurnState,
        rctx: &RequestContext,
    ) -> Result<TaskResponse, HopError> {
        let mut req = TaskRequest::new(
            task_type.unwrap_or(&self.base.task_type),
            parameters
                .cloned()
                .unwrap_or_else(|| json!({ "messages": state.transcript() })),
        )
        .with_preferred_agent(agent_id)
        .with_priority(self.base.priority);
        req.metadata = self.base.metadata.clone();
        self.executor
            .run_task(&req, rctx, Some(AgentTier::Sub), None)
            .await
    }
}
