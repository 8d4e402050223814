//! End-to-end scenarios over the in-process transport: simple round trip,
//! routing under saturation, budget trips, stream reordering, depth caps,
//! cancellation, and delivery guarantees.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcp::Orchestrator;
use serde_json::json;
use support::{connect_agent, is_cancel, run_agent, test_config};
use wire::{
    AgentDescriptor, AgentTier, Body, Budget, Delivery, ErrorCode, ErrorPayload, StreamChunk,
    StreamEnd, StreamStart, TaskContext, TaskRequest, TaskResponse, TaskStatus,
};

fn sub(id: &str, capability: &str) -> AgentDescriptor {
    AgentDescriptor::new(id, AgentTier::Sub).with_capability(capability)
}

async fn collect_terminal(
    mut rx: tokio::sync::mpsc::Receiver<wire::Message>,
) -> Vec<wire::Message> {
    let mut out = Vec::new();
    while let Some(msg) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("outcome before timeout")
    {
        let terminal = matches!(msg.body, Body::TaskResponse(_) | Body::StreamEnd(_));
        out.push(msg);
        if terminal {
            break;
        }
    }
    out
}

fn response_of(messages: &[wire::Message]) -> &TaskResponse {
    match &messages.last().expect("at least one message").body {
        Body::TaskResponse(resp) => resp,
        other => panic!("expected TASK_RESPONSE, got {:?}", other),
    }
}

#[tokio::test]
async fn simple_task_round_trip() {
    let orch = Orchestrator::new(test_config());
    let conn = connect_agent(&orch, sub("echo-1", "echo")).await;
    run_agent(conn, |req, _msg| async move {
        vec![Body::TaskResponse(TaskResponse::completed(
            req.task_id.clone(),
            req.parameters.clone(),
        ))]
    });

    let req = TaskRequest::new("echo", json!({"text": "hi"}));
    let ctx = TaskContext::new().with_timeout_ms(5_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;

    assert_eq!(messages.len(), 1);
    let resp = response_of(&messages);
    assert_eq!(resp.status, TaskStatus::Completed);
    assert_eq!(resp.result, Some(json!({"text": "hi"})));
    assert_eq!(resp.metrics.retry_count, 0);
}

#[tokio::test]
async fn saturated_workers_queue_and_drain() {
    let orch = Orchestrator::new(test_config());
    for id in ["w-a", "w-b"] {
        let conn = connect_agent(&orch, sub(id, "compute").with_max_concurrent(1)).await;
        run_agent(conn, |req, _msg| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            vec![Body::TaskResponse(TaskResponse::completed(
                req.task_id.clone(),
                json!({"done": true}),
            ))]
        });
    }

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let req = TaskRequest::new("compute", json!({}));
        let ctx = TaskContext::new().with_timeout_ms(10_000);
        receivers.push(orch.submit(req, ctx, Delivery::default()).await);
    }

    let mut queue_times = Vec::new();
    for rx in receivers {
        let messages = collect_terminal(rx).await;
        let resp = response_of(&messages);
        assert_eq!(resp.status, TaskStatus::Completed, "no request may fail");
        queue_times.push(resp.metrics.queue_time_ms);
    }
    // Two slots, three requests: the overflow request waited for a slot.
    assert!(
        queue_times.iter().any(|&q| q > 0),
        "one request must observe queue time, got {:?}",
        queue_times
    );
}

#[tokio::test]
async fn budget_trip_blocks_second_delegation() {
    let orch = Orchestrator::new(test_config());

    let sup_calls = Arc::new(AtomicU32::new(0));
    let sup_conn = connect_agent(
        &orch,
        AgentDescriptor::new("sup-1", AgentTier::Supervisor).with_capability("chat"),
    )
    .await;
    {
        let sup_calls = Arc::clone(&sup_calls);
        run_agent(sup_conn, move |req, _msg| {
            let sup_calls = Arc::clone(&sup_calls);
            async move {
                sup_calls.fetch_add(1, Ordering::SeqCst);
                vec![Body::TaskResponse(TaskResponse::completed(
                    req.task_id.clone(),
                    json!({"action": "delegate", "agent_id": "gpt-like"}),
                ))]
            }
        });
    }

    let gpt_conn = connect_agent(&orch, sub("gpt-like", "chat")).await;
    run_agent(gpt_conn, |req, _msg| async move {
        let mut resp =
            TaskResponse::completed(req.task_id.clone(), json!({"answer": "first sub-result"}));
        resp.metrics.cost_usd = 0.006;
        resp.metrics.model_used = Some("gpt-like".into());
        vec![Body::TaskResponse(resp)]
    });

    let req = TaskRequest::new("chat", json!({"q": "spend carefully"}));
    let ctx = TaskContext::new()
        .with_timeout_ms(10_000)
        .with_budget(Budget::new(0.01, 100_000));
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);

    assert_eq!(resp.status, TaskStatus::Failed);
    assert_eq!(resp.error_code, Some(ErrorCode::BudgetExceeded));
    let transcript = resp.result.as_ref().expect("transcript preserved")["transcript"]
        .as_array()
        .expect("transcript is an array")
        .clone();
    assert!(
        transcript
            .iter()
            .any(|m| m["content"]["answer"] == "first sub-result"),
        "transcript must contain the first sub-result: {transcript:?}"
    );
}

#[tokio::test]
async fn stream_reorder_within_window_is_transparent() {
    let orch = Orchestrator::new(test_config());
    let conn = connect_agent(&orch, sub("streamer", "stream")).await;
    run_agent(conn, |req, _msg| async move {
        let chunk = |sequence, v: i64| {
            Body::StreamChunk(StreamChunk {
                sequence,
                data: json!(v),
            })
        };
        vec![
            Body::StreamStart(StreamStart {
                task_id: req.task_id.clone(),
            }),
            chunk(0, 0),
            chunk(2, 2),
            chunk(1, 1),
            chunk(3, 3),
            Body::StreamEnd(StreamEnd {
                task_id: req.task_id.clone(),
                status: TaskStatus::Completed,
                error_code: None,
                metrics: Default::default(),
            }),
        ]
    });

    let req = TaskRequest::new("stream", json!({}));
    let ctx = TaskContext::new().with_timeout_ms(5_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;

    let mut sequences = Vec::new();
    let mut end_status = None;
    for msg in &messages {
        match &msg.body {
            Body::StreamChunk(c) => sequences.push(c.sequence),
            Body::StreamEnd(e) => end_status = Some((e.status, e.error_code)),
            Body::StreamStart(_) => {}
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert_eq!(end_status, Some((TaskStatus::Completed, None)));
}

#[tokio::test]
async fn stream_gap_beyond_window_fails_the_stream() {
    let mut cfg = test_config();
    cfg.executor.stream_window = 1;
    let orch = Orchestrator::new(cfg);
    let conn = connect_agent(&orch, sub("streamer", "stream")).await;
    run_agent(conn, |req, _msg| async move {
        let chunk = |sequence, v: i64| {
            Body::StreamChunk(StreamChunk {
                sequence,
                data: json!(v),
            })
        };
        vec![
            Body::StreamStart(StreamStart {
                task_id: req.task_id.clone(),
            }),
            chunk(0, 0),
            chunk(2, 2),
            chunk(3, 3),
        ]
    });

    let req = TaskRequest::new("stream", json!({}));
    let ctx = TaskContext::new().with_timeout_ms(5_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;

    let mut sequences = Vec::new();
    let mut end = None;
    for msg in &messages {
        match &msg.body {
            Body::StreamChunk(c) => sequences.push(c.sequence),
            Body::StreamEnd(e) => end = Some((e.status, e.error_code)),
            _ => {}
        }
    }
    assert_eq!(sequences, vec![0], "only the in-order prefix is observable");
    assert_eq!(end, Some((TaskStatus::Failed, Some(ErrorCode::StreamGap))));
}

#[tokio::test]
async fn depth_limit_forces_end_with_warning() {
    let mut cfg = test_config();
    cfg.max_depth = 2;
    let orch = Orchestrator::new(cfg);

    let sup_calls = Arc::new(AtomicU32::new(0));
    let sup_conn = connect_agent(
        &orch,
        AgentDescriptor::new("sup-1", AgentTier::Supervisor).with_capability("chat"),
    )
    .await;
    {
        let sup_calls = Arc::clone(&sup_calls);
        run_agent(sup_conn, move |req, _msg| {
            let sup_calls = Arc::clone(&sup_calls);
            async move {
                let n = sup_calls.fetch_add(1, Ordering::SeqCst) + 1;
                vec![Body::TaskResponse(TaskResponse::completed(
                    req.task_id.clone(),
                    json!({"action": "delegate", "agent_id": format!("sub-{n}")}),
                ))]
            }
        });
    }
    for id in ["sub-1", "sub-2", "sub-3"] {
        let conn = connect_agent(&orch, sub(id, "chat")).await;
        run_agent(conn, move |req, _msg| async move {
            vec![Body::TaskResponse(TaskResponse::completed(
                req.task_id.clone(),
                json!({"hop": req.preferred_agent}),
            ))]
        });
    }

    let req = TaskRequest::new("chat", json!({"q": "go deep"}));
    let ctx = TaskContext::new().with_timeout_ms(10_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);

    assert_eq!(resp.status, TaskStatus::Completed);
    assert!(
        resp.warnings.iter().any(|w| w.contains("DEPTH_EXCEEDED")),
        "warnings: {:?}",
        resp.warnings
    );
    let transcript = resp.result.as_ref().unwrap()["transcript"]
        .as_array()
        .unwrap()
        .clone();
    let hops: Vec<_> = transcript
        .iter()
        .filter(|m| m["role"].as_str().unwrap_or_default().starts_with("sub-"))
        .collect();
    assert_eq!(hops.len(), 2, "exactly two delegation results: {transcript:?}");
}

#[tokio::test]
async fn cancellation_stops_new_work_and_pings_the_agent() {
    let orch = Orchestrator::new(test_config());

    let task_requests = Arc::new(AtomicU32::new(0));
    let cancels_seen = Arc::new(AtomicU32::new(0));
    let conn = connect_agent(&orch, sub("slow-1", "slow")).await;
    {
        let task_requests = Arc::clone(&task_requests);
        let cancels_seen = Arc::clone(&cancels_seen);
        run_agent(conn, move |req, _msg| {
            let task_requests = Arc::clone(&task_requests);
            let cancels_seen = Arc::clone(&cancels_seen);
            async move {
                if is_cancel(&req) {
                    cancels_seen.fetch_add(1, Ordering::SeqCst);
                    return vec![];
                }
                task_requests.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                vec![Body::TaskResponse(TaskResponse::completed(
                    req.task_id.clone(),
                    json!({"too": "late"}),
                ))]
            }
        });
    }

    let req = TaskRequest::new("slow", json!({}));
    let mut ctx = TaskContext::new().with_timeout_ms(10_000);
    ctx.request_id = "req-cancel-1".to_string();
    let rx = orch.submit(req, ctx, Delivery::default()).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orch.cancel_request("req-cancel-1"));

    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);
    assert_eq!(resp.status, TaskStatus::Cancelled);

    // Within the grace period: the best-effort cancel reached the agent and
    // no further TASK_REQUESTs were issued for this request. The agent works
    // through its queue sequentially, so give it time to see the cancel; its
    // late completion is dropped as a duplicate past the terminal response.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(task_requests.load(Ordering::SeqCst), 1);
    assert_eq!(cancels_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_least_once_retries_and_counts() {
    let orch = Orchestrator::new(test_config());

    let deliveries = Arc::new(AtomicU32::new(0));
    let conn = connect_agent(&orch, sub("flaky-1", "flaky")).await;
    {
        let deliveries = Arc::clone(&deliveries);
        run_agent(conn, move |req, _msg| {
            let deliveries = Arc::clone(&deliveries);
            async move {
                if deliveries.fetch_add(1, Ordering::SeqCst) == 0 {
                    vec![Body::Error(ErrorPayload::new(
                        ErrorCode::AgentUnavailable,
                        "warming up",
                    ))]
                } else {
                    vec![Body::TaskResponse(TaskResponse::completed(
                        req.task_id.clone(),
                        json!({"ok": true}),
                    ))]
                }
            }
        });
    }

    let mut delivery = Delivery::at_least_once(3);
    delivery.retry_delay_ms = 10;
    let req = TaskRequest::new("flaky", json!({}));
    let ctx = TaskContext::new().with_timeout_ms(10_000);
    let rx = orch.submit(req, ctx, delivery).await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);

    assert_eq!(resp.status, TaskStatus::Completed);
    assert_eq!(resp.metrics.retry_count, 1);
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exactly_once_replays_from_the_idempotency_cache() {
    let orch = Orchestrator::new(test_config());

    let invocations = Arc::new(AtomicU32::new(0));
    let conn = connect_agent(&orch, sub("once-1", "compute")).await;
    {
        let invocations = Arc::clone(&invocations);
        run_agent(conn, move |req, _msg| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                let mut resp =
                    TaskResponse::completed(req.task_id.clone(), json!({"computed": 42}));
                resp.metrics.cost_usd = 0.5;
                vec![Body::TaskResponse(resp)]
            }
        });
    }

    let mut req = TaskRequest::new("compute", json!({}));
    req.task_id = "task-fixed-id".to_string();
    let budget = Budget::new(0.9, 100_000);

    for _ in 0..2 {
        let ctx = TaskContext::new()
            .with_timeout_ms(5_000)
            .with_budget(budget.clone());
        let rx = orch
            .submit(req.clone(), ctx, Delivery::exactly_once(2))
            .await;
        let messages = collect_terminal(rx).await;
        let resp = response_of(&messages);
        assert_eq!(resp.status, TaskStatus::Completed);
        assert_eq!(resp.result, Some(json!({"computed": 42})));
    }

    // Same task_id delivered twice: the agent ran once, the second response
    // came from the idempotency cache without touching the agent or budget.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn agent_disconnect_fails_pending_task() {
    let orch = Orchestrator::new(test_config());
    let conn = connect_agent(&orch, sub("doomed-1", "compute")).await;
    let conn = Arc::new(conn);
    {
        let conn2 = Arc::clone(&conn);
        tokio::spawn(async move {
            // Receive the task, then vanish without answering.
            let _ = conn2.recv().await;
            conn2.disconnect();
        });
    }

    let req = TaskRequest::new("compute", json!({}));
    let ctx = TaskContext::new().with_timeout_ms(5_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);

    assert_eq!(resp.status, TaskStatus::Failed);
    assert_eq!(resp.error_code, Some(ErrorCode::AgentUnavailable));
}

#[tokio::test]
async fn tool_outside_allow_list_is_permission_denied_and_sickens_the_agent() {
    let orch = Orchestrator::new(test_config());
    let conn = connect_agent(
        &orch,
        sub("tooler-1", "tools").with_allowed_tool("search"),
    )
    .await;
    run_agent(conn, |req, _msg| async move {
        vec![Body::TaskResponse(TaskResponse::completed(
            req.task_id.clone(),
            json!({"answer": "did a thing", "tools_used": ["shell"]}),
        ))]
    });

    // Default misuse threshold is 3; each violation fails its task.
    for _ in 0..3 {
        let req = TaskRequest::new("tools", json!({}));
        let ctx = TaskContext::new().with_timeout_ms(5_000);
        let rx = orch.submit(req, ctx, Delivery::default()).await;
        let messages = collect_terminal(rx).await;
        let resp = response_of(&messages);
        assert_eq!(resp.status, TaskStatus::Failed);
        assert_eq!(resp.error_code, Some(ErrorCode::PermissionDenied));
    }

    assert_eq!(
        orch.registry().snapshot().get("tooler-1").unwrap().health,
        wire::HealthState::Unhealthy
    );
}

#[tokio::test]
async fn route_unavailable_when_no_agent_lists_the_capability() {
    let orch = Orchestrator::new(test_config());
    let req = TaskRequest::new("nonexistent", json!({}));
    let ctx = TaskContext::new().with_timeout_ms(1_000);
    let rx = orch.submit(req, ctx, Delivery::default()).await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);
    assert_eq!(resp.status, TaskStatus::Failed);
    assert_eq!(resp.error_code, Some(ErrorCode::RouteUnavailable));
}

#[tokio::test]
async fn rate_limit_surfaces_retry_after_hint() {
    let mut cfg = test_config();
    cfg.rate_limits.per_user = 1;
    let orch = Orchestrator::new(cfg);
    let conn = connect_agent(&orch, sub("echo-1", "echo")).await;
    run_agent(conn, |req, _msg| async move {
        vec![Body::TaskResponse(TaskResponse::completed(
            req.task_id.clone(),
            json!({}),
        ))]
    });

    let ctx = || TaskContext::new().with_user("u-1").with_timeout_ms(5_000);
    let rx = orch
        .submit(TaskRequest::new("echo", json!({})), ctx(), Delivery::default())
        .await;
    assert_eq!(response_of(&collect_terminal(rx).await).status, TaskStatus::Completed);

    let rx = orch
        .submit(TaskRequest::new("echo", json!({})), ctx(), Delivery::default())
        .await;
    let messages = collect_terminal(rx).await;
    let resp = response_of(&messages);
    assert_eq!(resp.status, TaskStatus::Failed);
    assert_eq!(resp.error_code, Some(ErrorCode::RateLimited));
    assert!(resp.metrics.custom.contains_key("retry_after_ms"));
}
