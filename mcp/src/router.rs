//! Router: picks an agent for a task from capability, routing tags, load,
//! cost, latency, and session affinity.
//!
//! Selection is deterministic under identical inputs: candidates are scored
//! and ties broken by lexicographic agent id. When every candidate is
//! saturated the task waits in a bounded priority queue keyed by
//! `(-priority, arrival)`; the queue at its cap rejects with `BACKPRESSURE`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wire::{AgentTier, ErrorCode, TaskContext, TaskRequest};

use crate::budget::BudgetGuard;
use crate::registry::{AgentEntry, Registry};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no READY agent for task_type '{0}'")]
    Unavailable(String),
    #[error("router queue at capacity")]
    Backpressure,
    #[error("budget exhausted before dispatch")]
    BudgetExceeded,
    #[error("deadline elapsed while queued")]
    DeadlineElapsed,
    #[error("request cancelled while queued")]
    Cancelled,
}

impl RouteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::Unavailable(_) => ErrorCode::RouteUnavailable,
            RouteError::Backpressure => ErrorCode::Backpressure,
            RouteError::BudgetExceeded => ErrorCode::BudgetExceeded,
            RouteError::DeadlineElapsed => ErrorCode::Timeout,
            RouteError::Cancelled => ErrorCode::Internal,
        }
    }
}

/// Composite score weights. Defaults per the routing design:
/// capability 0.35, load 0.25, cost 0.15, latency 0.15, affinity 0.10.
#[derive(Debug, Clone)]
pub struct RouterWeights {
    pub capability: f64,
    pub load: f64,
    pub cost: f64,
    pub latency: f64,
    pub affinity: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            capability: 0.35,
            load: 0.25,
            cost: 0.15,
            latency: 0.15,
            affinity: 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub weights: RouterWeights,
    /// Saturation queue depth; one more waiter than this is BACKPRESSURE.
    pub queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            weights: RouterWeights::default(),
            queue_capacity: 256,
        }
    }
}

struct Waiter {
    priority: u8,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earliest arrival.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

enum TrySelect {
    Chosen(Arc<AgentEntry>),
    Saturated,
}

/// Scores and selects agents; owns the saturation queue.
pub struct Router {
    registry: Arc<Registry>,
    cfg: RouterConfig,
    /// session_id → agent that served it last.
    affinity: DashMap<String, String>,
    waiters: Mutex<BinaryHeap<Waiter>>,
    waiter_seq: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<Registry>, cfg: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cfg,
            affinity: DashMap::new(),
            waiters: Mutex::new(BinaryHeap::new()),
            waiter_seq: AtomicU64::new(0),
        })
    }

    /// Selects an agent and claims one of its concurrency slots, waiting in
    /// the priority queue while every candidate is saturated. The caller
    /// must `release` the returned agent when the task settles.
    pub async fn select_or_wait(
        &self,
        req: &TaskRequest,
        ctx: &TaskContext,
        tier: Option<AgentTier>,
        budget: &BudgetGuard,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Arc<AgentEntry>, RouteError> {
        loop {
            match self.try_select(req, ctx, tier, budget)? {
                TrySelect::Chosen(entry) => return Ok(entry),
                TrySelect::Saturated => {
                    let rx = self.enqueue(req.priority)?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RouteError::Cancelled),
                        _ = sleep_until_opt(deadline) => return Err(RouteError::DeadlineElapsed),
                        _ = rx => {}
                    }
                }
            }
        }
    }

    /// Returns a claimed slot and wakes the best queued waiter.
    pub fn release(&self, entry: &AgentEntry) {
        entry.release_slot();
        self.wake_one();
    }

    fn try_select(
        &self,
        req: &TaskRequest,
        ctx: &TaskContext,
        tier: Option<AgentTier>,
        budget: &BudgetGuard,
    ) -> Result<TrySelect, RouteError> {
        let snapshot = self.registry.snapshot();

        if let Some(ref preferred) = req.preferred_agent {
            if let Some(entry) = snapshot.get(preferred) {
                let tier_ok = tier.map(|t| entry.descriptor.tier == t).unwrap_or(true);
                if entry.is_ready()
                    && tier_ok
                    && entry.descriptor.can_handle(&req.task_type)
                    && budget.admit(entry.descriptor.cost_per_call_usd).is_ok()
                {
                    return if entry.try_claim_slot() {
                        self.record_affinity(ctx, entry);
                        Ok(TrySelect::Chosen(Arc::clone(entry)))
                    } else {
                        Ok(TrySelect::Saturated)
                    };
                }
            }
        }

        let mut candidates = snapshot.candidates(&req.task_type, &ctx.routing_tags);
        if let Some(tier) = tier {
            candidates.retain(|e| e.descriptor.tier == tier);
        }
        if candidates.is_empty() {
            return Err(RouteError::Unavailable(req.task_type.clone()));
        }

        // Admission control: a candidate whose selection would immediately
        // exceed the task budget is skipped.
        candidates.retain(|e| budget.admit(e.descriptor.cost_per_call_usd).is_ok());
        if candidates.is_empty() {
            return Err(RouteError::BudgetExceeded);
        }

        let remaining_usd = budget.snapshot().map(|b| b.remaining_usd());
        let mut scored: Vec<(f64, Arc<AgentEntry>)> = candidates
            .into_iter()
            .map(|e| (self.score(&e, ctx, remaining_usd), e))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.agent_id().cmp(b.agent_id()))
        });

        for (_, entry) in scored {
            if entry.try_claim_slot() {
                self.record_affinity(ctx, &entry);
                return Ok(TrySelect::Chosen(entry));
            }
        }
        Ok(TrySelect::Saturated)
    }

    fn score(&self, entry: &AgentEntry, ctx: &TaskContext, remaining_usd: Option<f64>) -> f64 {
        let w = &self.cfg.weights;
        let d = &entry.descriptor;

        // Specialists outrank generalists for the capability component.
        let capability = 1.0 / d.capabilities.len().max(1) as f64;
        let load = 1.0 - f64::from(entry.active_tasks()) / f64::from(d.max_concurrent.max(1));
        let cost = match (d.cost_per_call_usd, remaining_usd) {
            (Some(c), Some(rem)) if rem > 0.0 => 1.0 - (c / rem).min(1.0),
            _ => 0.5,
        };
        let latency = d
            .avg_latency_ms
            .map(|ms| 1.0 / (1.0 + ms as f64 / 1_000.0))
            .unwrap_or(0.5);
        let affinity = ctx
            .session_id
            .as_ref()
            .and_then(|s| self.affinity.get(s))
            .map(|served_by| if *served_by == d.agent_id { 1.0 } else { 0.0 })
            .unwrap_or(0.0);

        w.capability * capability
            + w.load * load
            + w.cost * cost
            + w.latency * latency
            + w.affinity * affinity
    }

    fn record_affinity(&self, ctx: &TaskContext, entry: &AgentEntry) {
        if let Some(ref session) = ctx.session_id {
            self.affinity
                .insert(session.clone(), entry.agent_id().to_string());
        }
    }

    fn enqueue(&self, priority: u8) -> Result<oneshot::Receiver<()>, RouteError> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if waiters.len() >= self.cfg.queue_capacity {
            // Cancelled waiters count against the cap until pruned.
            let mut kept: BinaryHeap<Waiter> =
                waiters.drain().filter(|w| !w.wake.is_closed()).collect();
            std::mem::swap(&mut *waiters, &mut kept);
            if waiters.len() >= self.cfg.queue_capacity {
                return Err(RouteError::Backpressure);
            }
        }
        let (tx, rx) = oneshot::channel();
        waiters.push(Waiter {
            priority,
            seq: self.waiter_seq.fetch_add(1, Ordering::SeqCst),
            wake: tx,
        });
        Ok(rx)
    }

    fn wake_one(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(waiter) = waiters.pop() {
            if waiter.wake.send(()).is_ok() {
                break;
            }
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wire::{AgentDescriptor, Budget};

    fn setup() -> (Arc<Registry>, Arc<Router>) {
        let registry = Registry::new(Duration::from_secs(5));
        let router = Router::new(Arc::clone(&registry), RouterConfig::default());
        (registry, router)
    }

    fn sub(id: &str, capability: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, AgentTier::Sub)
            .with_capability(capability)
            .with_max_concurrent(4)
    }

    async fn select(
        router: &Router,
        req: &TaskRequest,
        ctx: &TaskContext,
    ) -> Result<Arc<AgentEntry>, RouteError> {
        let budget = BudgetGuard::unlimited();
        router
            .select_or_wait(req, ctx, None, &budget, None, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn no_candidate_is_route_unavailable() {
        let (_registry, router) = setup();
        let req = TaskRequest::new("echo", serde_json::json!({}));
        assert!(matches!(
            select(&router, &req, &TaskContext::new()).await,
            Err(RouteError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn preferred_agent_honored_when_capable() {
        let (registry, router) = setup();
        registry.register(sub("w-a", "compute")).unwrap();
        registry.register(sub("w-b", "compute")).unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({})).with_preferred_agent("w-b");
        let entry = select(&router, &req, &TaskContext::new()).await.unwrap();
        assert_eq!(entry.agent_id(), "w-b");
    }

    #[tokio::test]
    async fn preferred_agent_ignored_when_not_capable() {
        let (registry, router) = setup();
        registry.register(sub("w-a", "compute")).unwrap();
        registry.register(sub("other", "vision")).unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({})).with_preferred_agent("other");
        let entry = select(&router, &req, &TaskContext::new()).await.unwrap();
        assert_eq!(entry.agent_id(), "w-a");
    }

    #[tokio::test]
    async fn ties_break_lexicographically() {
        let (registry, router) = setup();
        registry.register(sub("w-b", "compute")).unwrap();
        registry.register(sub("w-a", "compute")).unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let entry = select(&router, &req, &TaskContext::new()).await.unwrap();
        assert_eq!(entry.agent_id(), "w-a");
    }

    #[tokio::test]
    async fn lighter_load_wins() {
        let (registry, router) = setup();
        registry.register(sub("w-a", "compute")).unwrap();
        registry.register(sub("w-b", "compute")).unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({}));

        // First selection lands on w-a (tie-break); holding its slot tilts
        // the load component toward w-b for the next one.
        let first = select(&router, &req, &TaskContext::new()).await.unwrap();
        assert_eq!(first.agent_id(), "w-a");
        let second = select(&router, &req, &TaskContext::new()).await.unwrap();
        assert_eq!(second.agent_id(), "w-b");
    }

    #[tokio::test]
    async fn budget_admission_skips_expensive_candidates() {
        let (registry, router) = setup();
        registry
            .register(sub("cheap", "compute").with_cost_hint(0.001))
            .unwrap();
        registry
            .register(sub("pricey", "compute").with_cost_hint(5.0))
            .unwrap();
        let budget = BudgetGuard::new(Some(Budget::new(0.01, 10_000)));
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let entry = router
            .select_or_wait(
                &req,
                &TaskContext::new(),
                None,
                &budget,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(entry.agent_id(), "cheap");
    }

    #[tokio::test]
    async fn all_candidates_over_budget_is_budget_exceeded() {
        let (registry, router) = setup();
        registry
            .register(sub("pricey", "compute").with_cost_hint(5.0))
            .unwrap();
        let budget = BudgetGuard::new(Some(Budget::new(0.01, 10_000)));
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let err = router
            .select_or_wait(
                &req,
                &TaskContext::new(),
                None,
                &budget,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::BudgetExceeded));
    }

    #[tokio::test]
    async fn session_affinity_sticks() {
        let (registry, router) = setup();
        registry.register(sub("w-a", "compute")).unwrap();
        registry.register(sub("w-b", "compute")).unwrap();
        let ctx = TaskContext::new().with_session("s-1");
        let req = TaskRequest::new("compute", serde_json::json!({}));

        let first = select(&router, &req, &ctx).await.unwrap();
        assert_eq!(first.agent_id(), "w-a");
        // Affinity (0.10) outweighs the load delta (0.25 * 1/4), so the
        // session stays on w-a even while it holds a slot.
        let second = select(&router, &req, &ctx).await.unwrap();
        assert_eq!(second.agent_id(), "w-a");
    }

    #[tokio::test]
    async fn saturated_waits_until_release() {
        let (registry, router) = setup();
        registry
            .register(sub("only", "compute").with_max_concurrent(1))
            .unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let held = select(&router, &req, &TaskContext::new()).await.unwrap();

        let waiting = {
            let router = Arc::clone(&router);
            let req = req.clone();
            tokio::spawn(async move {
                let budget = BudgetGuard::unlimited();
                router
                    .select_or_wait(
                        &req,
                        &TaskContext::new(),
                        None,
                        &budget,
                        None,
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        router.release(&held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.agent_id(), "only");
    }

    #[tokio::test]
    async fn queue_cap_is_backpressure_until_a_dequeue() {
        let registry = Registry::new(Duration::from_secs(5));
        let router = Router::new(
            Arc::clone(&registry),
            RouterConfig {
                queue_capacity: 1,
                ..Default::default()
            },
        );
        registry
            .register(sub("only", "compute").with_max_concurrent(1))
            .unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let held = select(&router, &req, &TaskContext::new()).await.unwrap();

        // One waiter fits in the queue.
        let waiting = {
            let router = Arc::clone(&router);
            let req = req.clone();
            tokio::spawn(async move {
                let budget = BudgetGuard::unlimited();
                router
                    .select_or_wait(
                        &req,
                        &TaskContext::new(),
                        None,
                        &budget,
                        None,
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.queued(), 1);

        // The queue is at cap: the next arrival is refused.
        let budget = BudgetGuard::unlimited();
        let err = router
            .select_or_wait(
                &req,
                &TaskContext::new(),
                None,
                &budget,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Backpressure));

        router.release(&held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.agent_id(), "only");
    }

    #[tokio::test]
    async fn queued_waiter_times_out_at_deadline() {
        let (registry, router) = setup();
        registry
            .register(sub("only", "compute").with_max_concurrent(1))
            .unwrap();
        let req = TaskRequest::new("compute", serde_json::json!({}));
        let _held = select(&router, &req, &TaskContext::new()).await.unwrap();

        let budget = BudgetGuard::unlimited();
        let err = router
            .select_or_wait(
                &req,
                &TaskContext::new(),
                None,
                &budget,
                Some(Instant::now() + Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::DeadlineElapsed));
    }
}
