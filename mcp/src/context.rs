//! Per-request execution context: wire context plus the runtime handles the
//! executor and graph need (cancellation, budget, trace, deadline).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wire::{Delivery, TaskContext};

use crate::auth::Principal;
use crate::budget::BudgetGuard;
use crate::trace::TraceContext;

/// Everything one request carries through the pipeline. Cloned freely; the
/// budget guard and cancel token are shared handles.
#[derive(Clone)]
pub struct RequestContext {
    pub task: TaskContext,
    pub trace: TraceContext,
    pub cancel: CancellationToken,
    pub budget: Arc<BudgetGuard>,
    /// Absolute deadline for the whole request, when one exists.
    pub deadline: Option<Instant>,
    pub principal: Option<Principal>,
    /// Delivery contract propagated to every hop of this request.
    pub delivery: Delivery,
}

impl RequestContext {
    /// Builds the context at ingress: trace generated when absent, budget
    /// guard seeded from the wire context, deadline derived from
    /// `timeout_ms`.
    pub fn at_ingress(task: TaskContext, cancel: CancellationToken) -> Self {
        let budget = Arc::new(BudgetGuard::new(task.budget.clone()));
        let deadline = task
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        Self {
            task,
            trace: TraceContext::root(),
            cancel,
            budget,
            deadline,
            principal: None,
            delivery: Delivery::default(),
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Caps the deadline at `at` when that is sooner.
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Time left until the request deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Effective timeout for one task: the minimum of the message timeout,
    /// the remaining request deadline, and the agent's processing-time cap.
    pub fn effective_timeout(
        &self,
        agent_cap_ms: Option<u64>,
        default_timeout: Duration,
    ) -> Duration {
        let mut timeout = self
            .task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        if let Some(remaining) = self.remaining() {
            timeout = timeout.min(remaining);
        }
        if let Some(cap_ms) = agent_cap_ms {
            timeout = timeout.min(Duration::from_millis(cap_ms));
        }
        timeout
    }
}
