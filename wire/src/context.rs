//! Per-message context: caller identity, deadlines, budget, resource limits,
//! and the delivery contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_priority() -> u8 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// Caller-scoped context carried on every message and propagated across hops.
///
/// `request_id` and `user_id` travel unchanged through the whole pipeline;
/// budget and limits bound what the request may consume downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Stable id for the whole request; generated at ingress when absent.
    #[serde(default = "new_request_id")]
    pub request_id: String,
    /// Soft per-message timeout; the executor takes the minimum of this, the
    /// request deadline, and the agent's processing-time cap.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    /// Tags the router matches against agent routing tags.
    #[serde(default)]
    pub routing_tags: Vec<String>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            request_id: new_request_id(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Spend ceiling and accumulators for one request.
///
/// The containing task must fail with `BUDGET_EXCEEDED` before dispatching
/// new work once `used_* + estimate` would cross `max_*`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default)]
    pub max_usd: f64,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub used_usd: f64,
    #[serde(default)]
    pub used_tokens: u64,
    /// Per-model spend, keyed by model name.
    #[serde(default)]
    pub model_costs: HashMap<String, f64>,
}

impl Budget {
    pub fn new(max_usd: f64, max_tokens: u64) -> Self {
        Self {
            max_usd,
            max_tokens,
            ..Default::default()
        }
    }

    pub fn remaining_usd(&self) -> f64 {
        (self.max_usd - self.used_usd).max(0.0)
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.max_tokens.saturating_sub(self.used_tokens)
    }

    /// True when charging `cost_usd`/`tokens` would cross either ceiling.
    pub fn would_exceed(&self, cost_usd: f64, tokens: u64) -> bool {
        self.used_usd + cost_usd > self.max_usd || self.used_tokens + tokens > self.max_tokens
    }

    /// Records a spend against the accumulators. Callers check
    /// [`Budget::would_exceed`] first; charge itself does not fail.
    pub fn charge(&mut self, model: Option<&str>, cost_usd: f64, tokens: u64) {
        self.used_usd += cost_usd;
        self.used_tokens += tokens;
        if let Some(model) = model {
            *self.model_costs.entry(model.to_string()).or_insert(0.0) += cost_usd;
        }
    }
}

/// Resource caps an agent or request declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,
    #[serde(default)]
    pub max_processing_time_ms: Option<u64>,
}

/// How many times a message may reach its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Guarantee {
    /// Fire-and-forget.
    AtMostOnce,
    /// Retried until acknowledged; the receiver may see duplicates.
    AtLeastOnce,
    /// Retried with receiver-side dedup through the idempotency cache.
    ExactlyOnce,
}

impl Default for Guarantee {
    fn default() -> Self {
        Guarantee::AtMostOnce
    }
}

/// Delivery contract: guarantee, retry budget, and priority (0–9, higher wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub guarantee: Guarantee,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub require_ack: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            guarantee: Guarantee::AtMostOnce,
            retry_count: 0,
            retry_delay_ms: default_retry_delay_ms(),
            require_ack: false,
            priority: default_priority(),
        }
    }
}

impl Delivery {
    pub fn at_least_once(retry_count: u32) -> Self {
        Self {
            guarantee: Guarantee::AtLeastOnce,
            retry_count,
            ..Default::default()
        }
    }

    pub fn exactly_once(retry_count: u32) -> Self {
        Self {
            guarantee: Guarantee::ExactlyOnce,
            retry_count,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_charge_accumulates_per_model() {
        let mut budget = Budget::new(1.0, 1_000);
        budget.charge(Some("gpt-like"), 0.25, 100);
        budget.charge(Some("gpt-like"), 0.25, 100);
        budget.charge(Some("vision"), 0.1, 50);
        assert_eq!(budget.used_usd, 0.6);
        assert_eq!(budget.used_tokens, 250);
        assert_eq!(budget.model_costs["gpt-like"], 0.5);
        assert_eq!(budget.model_costs["vision"], 0.1);
    }

    #[test]
    fn budget_would_exceed_checks_both_axes() {
        let mut budget = Budget::new(0.01, 100);
        budget.charge(None, 0.006, 10);
        assert!(!budget.would_exceed(0.004, 10));
        assert!(budget.would_exceed(0.006, 10));
        assert!(budget.would_exceed(0.0, 91));
    }

    #[test]
    fn delivery_defaults_are_fire_and_forget() {
        let delivery = Delivery::default();
        assert_eq!(delivery.guarantee, Guarantee::AtMostOnce);
        assert_eq!(delivery.retry_count, 0);
        assert_eq!(delivery.priority, 5);
    }
}
