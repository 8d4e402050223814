//! Budget & rate guard: per-request spend accumulators and sliding-window
//! rate limits.
//!
//! The budget guard is owned by one request; there is no cross-request
//! sharing. The rate limiter is global and keyed per user, session, and
//! agent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use wire::{Budget, ErrorCode};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("budget exceeded: {resource}")]
    BudgetExceeded { resource: &'static str },
    #[error("rate limited; retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
}

impl GuardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GuardError::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            GuardError::RateLimited { .. } => ErrorCode::RateLimited,
        }
    }
}

#[derive(Debug, Default)]
struct BudgetInner {
    budget: Option<Budget>,
    /// Most expensive sub-result seen so far; feeds the admission estimate.
    max_sub_cost: f64,
}

/// Accumulates spend for one request and gates new dispatches.
///
/// A request without a budget admits everything; with one, a hop is admitted
/// only while `used + estimate ≤ max`, where the estimate is the larger of
/// the candidate's cost hint and the most expensive sub-result observed.
#[derive(Debug)]
pub struct BudgetGuard {
    inner: Mutex<BudgetInner>,
}

impl BudgetGuard {
    pub fn new(budget: Option<Budget>) -> Self {
        Self {
            inner: Mutex::new(BudgetInner {
                budget,
                max_sub_cost: 0.0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Gate for dispatching new work. `cost_hint` is the candidate agent's
    /// per-call estimate when it declares one.
    pub fn admit(&self, cost_hint: Option<f64>) -> Result<(), GuardError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ref budget) = inner.budget else {
            return Ok(());
        };
        if budget.used_usd >= budget.max_usd {
            return Err(GuardError::BudgetExceeded { resource: "usd" });
        }
        if budget.used_tokens >= budget.max_tokens {
            return Err(GuardError::BudgetExceeded { resource: "tokens" });
        }
        let estimate = cost_hint.unwrap_or(0.0).max(inner.max_sub_cost);
        if estimate > 0.0 && budget.used_usd + estimate > budget.max_usd {
            return Err(GuardError::BudgetExceeded { resource: "usd" });
        }
        Ok(())
    }

    /// Records a sub-result's spend. Returns an error when the spend crossed
    /// a ceiling; the caller must not dispatch further work.
    pub fn charge(
        &self,
        model: Option<&str>,
        cost_usd: f64,
        tokens: u64,
    ) -> Result<(), GuardError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if cost_usd > inner.max_sub_cost {
            inner.max_sub_cost = cost_usd;
        }
        let Some(ref mut budget) = inner.budget else {
            return Ok(());
        };
        budget.charge(model, cost_usd, tokens);
        if budget.used_usd > budget.max_usd {
            return Err(GuardError::BudgetExceeded { resource: "usd" });
        }
        if budget.used_tokens > budget.max_tokens {
            return Err(GuardError::BudgetExceeded { resource: "tokens" });
        }
        Ok(())
    }

    /// Current accumulator values, for response metadata.
    pub fn snapshot(&self) -> Option<Budget> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.budget.clone()
    }
}

/// Which sliding window a hit counts against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    User(String),
    Session(String),
    Agent(String),
}

/// Per-window caps. Defaults: 100/min per user and session, 600/min per agent.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub window: Duration,
    pub per_user: u32,
    pub per_session: u32,
    pub per_agent: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            per_user: 100,
            per_session: 100,
            per_agent: 600,
        }
    }
}

/// Sliding-window rate limiter. Hits are timestamps pruned as the window
/// moves; the retry hint is how long until the oldest hit leaves the window.
pub struct RateLimiter {
    limits: RateLimits,
    hits: DashMap<RateKey, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            hits: DashMap::new(),
        }
    }

    fn cap_for(&self, key: &RateKey) -> u32 {
        match key {
            RateKey::User(_) => self.limits.per_user,
            RateKey::Session(_) => self.limits.per_session,
            RateKey::Agent(_) => self.limits.per_agent,
        }
    }

    /// Records a hit against `key`, or reports how long to back off.
    pub fn check(&self, key: RateKey) -> Result<(), GuardError> {
        let cap = self.cap_for(&key) as usize;
        let now = Instant::now();
        let mut entry = self.hits.entry(key).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= self.limits.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= cap {
            let oldest = *entry.front().unwrap_or(&now);
            let retry_after = self
                .limits
                .window
                .saturating_sub(now.duration_since(oldest));
            return Err(GuardError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }
        entry.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_trips_after_ceiling_crossed() {
        let guard = BudgetGuard::new(Some(Budget::new(0.01, 1_000)));
        assert!(guard.charge(Some("gpt-like"), 0.006, 100).is_ok());
        assert!(guard.admit(Some(0.006)).is_err());
        // Without a hint the observed max sub-cost still blocks.
        assert!(guard.admit(None).is_err());
    }

    #[test]
    fn admission_passes_under_budget() {
        let guard = BudgetGuard::new(Some(Budget::new(1.0, 1_000)));
        assert!(guard.admit(Some(0.5)).is_ok());
        guard.charge(None, 0.5, 10).unwrap();
        assert!(guard.admit(Some(0.4)).is_ok());
        assert!(guard.admit(Some(0.6)).is_err());
    }

    #[test]
    fn token_ceiling_counts_too() {
        let guard = BudgetGuard::new(Some(Budget::new(10.0, 100)));
        assert!(guard.charge(None, 0.0, 150).is_err());
        assert!(guard.admit(None).is_err());
    }

    #[test]
    fn no_budget_admits_everything() {
        let guard = BudgetGuard::unlimited();
        assert!(guard.admit(Some(1e9)).is_ok());
        assert!(guard.charge(None, 1e9, u64::MAX / 2).is_ok());
    }

    #[test]
    fn rate_limiter_caps_within_window() {
        let limiter = RateLimiter::new(RateLimits {
            window: Duration::from_secs(60),
            per_user: 3,
            per_session: 100,
            per_agent: 100,
        });
        let key = RateKey::User("u1".into());
        for _ in 0..3 {
            assert!(limiter.check(key.clone()).is_ok());
        }
        match limiter.check(key) {
            Err(GuardError::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn rate_limiter_window_slides() {
        let limiter = RateLimiter::new(RateLimits {
            window: Duration::from_millis(30),
            per_user: 1,
            per_session: 1,
            per_agent: 1,
        });
        let key = RateKey::User("u1".into());
        assert!(limiter.check(key.clone()).is_ok());
        assert!(limiter.check(key.clone()).is_err());
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check(key).is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimits {
            window: Duration::from_secs(60),
            per_user: 1,
            per_session: 1,
            per_agent: 1,
        });
        assert!(limiter.check(RateKey::User("a".into())).is_ok());
        assert!(limiter.check(RateKey::User("b".into())).is_ok());
        assert!(limiter.check(RateKey::Session("a".into())).is_ok());
    }
}
