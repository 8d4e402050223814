//! Shared harness for orchestrator integration tests: in-process mock
//! agents speaking the real transport path.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mcp::transport::{connect_in_process, InProcessConn};
use mcp::{Orchestrator, OrchestratorConfig};
use tokio::task::JoinHandle;
use wire::{
    AgentDescriptor, Body, Event, Message, TaskRequest, CANCEL_TASK_TYPE, EVENT_REGISTER,
};

pub const TEST_SECRET: &str = "integration-test-secret";

/// `RUST_LOG=debug cargo test` shows the orchestrator's tracing output.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> OrchestratorConfig {
    init_logging();
    let mut cfg = OrchestratorConfig::new(TEST_SECRET);
    cfg.heartbeat_interval = Duration::from_secs(60);
    cfg
}

/// Registers an agent over the in-process transport, authenticating with a
/// token minted for its own id.
pub async fn connect_agent(orch: &Arc<Orchestrator>, descriptor: AgentDescriptor) -> InProcessConn {
    let token = orch
        .gate()
        .issue(&descriptor.agent_id, &[], Duration::from_secs(3600))
        .expect("token issues");
    let data = serde_json::to_value(&descriptor).expect("descriptor serializes");
    let first = Message::event(Event::new(EVENT_REGISTER, data))
        .with_sender(descriptor.agent_id.clone())
        .with_token(token);
    connect_in_process(orch.hub(), first)
        .await
        .expect("agent connects")
}

/// Drives an agent: every TASK_REQUEST goes through `handler`, whose bodies
/// are sent back on the task's correlation id. `cancel` tasks are passed to
/// the handler too (most handlers ignore them).
pub fn run_agent<F, Fut>(conn: InProcessConn, handler: F) -> JoinHandle<()>
where
    F: Fn(TaskRequest, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Body>> + Send,
{
    tokio::spawn(async move {
        while let Some(msg) = conn.recv().await {
            let Body::TaskRequest(req) = msg.body.clone() else {
                continue;
            };
            let replies = handler(req, msg.clone()).await;
            for body in replies {
                let reply = Message::reply_to(&msg, body).with_sender(conn.peer_id().to_string());
                if conn.send(reply).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Handler helper: true when the request is a cancellation probe.
pub fn is_cancel(req: &TaskRequest) -> bool {
    req.task_type == CANCEL_TASK_TYPE
}
