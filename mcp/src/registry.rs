//! Agent registry: the only globally shared mutable structure.
//!
//! Writers serialize under a single write lock and publish a new immutable
//! snapshot with an incremented epoch; readers clone the current `Arc` and
//! never block. Live counters (active tasks, last heartbeat) are shared
//! atomics so they survive snapshot replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wire::{AgentDescriptor, HealthState};

/// Missed-heartbeat multiplier: silence for 3× the interval marks an agent
/// UNHEALTHY.
const HEARTBEAT_GRACE_INTERVALS: u32 = 3;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent '{0}' is already registered")]
    Duplicate(String),
    #[error("agent '{0}' is not registered")]
    NotFound(String),
    #[error("agent '{0}' is gone; re-register to change it")]
    Gone(String),
}

/// Registry change notifications, for components that track churn.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(String),
    Deregistered(String),
    HealthChanged(String, HealthState),
}

/// One agent as the registry sees it: the immutable descriptor plus live
/// counters shared across snapshots.
#[derive(Debug)]
pub struct AgentEntry {
    pub descriptor: AgentDescriptor,
    pub health: HealthState,
    active_tasks: Arc<AtomicU32>,
    last_heartbeat_ms: Arc<AtomicU64>,
}

impl AgentEntry {
    fn new(descriptor: AgentDescriptor, now_ms: u64) -> Self {
        Self {
            descriptor,
            health: HealthState::Ready,
            active_tasks: Arc::new(AtomicU32::new(0)),
            last_heartbeat_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    fn with_health(&self, health: HealthState) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            health,
            active_tasks: Arc::clone(&self.active_tasks),
            last_heartbeat_ms: Arc::clone(&self.last_heartbeat_ms),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    pub fn is_ready(&self) -> bool {
        self.health == HealthState::Ready
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_tasks() < self.descriptor.max_concurrent
    }

    /// Atomically claims one concurrency slot; false when saturated.
    pub fn try_claim_slot(&self) -> bool {
        self.active_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.descriptor.max_concurrent).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn release_slot(&self) {
        let _ = self
            .active_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Immutable registry view at one epoch.
#[derive(Debug)]
pub struct Snapshot {
    pub epoch: u64,
    agents: HashMap<String, Arc<AgentEntry>>,
}

impl Snapshot {
    pub fn get(&self, agent_id: &str) -> Option<&Arc<AgentEntry>> {
        self.agents.get(agent_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentEntry>> {
        self.agents.values()
    }

    /// READY agents listing `task_type`, carrying every requested routing tag.
    pub fn candidates(&self, task_type: &str, tags: &[String]) -> Vec<Arc<AgentEntry>> {
        self.agents
            .values()
            .filter(|e| e.is_ready())
            .filter(|e| e.descriptor.can_handle(task_type))
            .filter(|e| tags.iter().all(|t| e.descriptor.routing_tags.contains(t)))
            .cloned()
            .collect()
    }

    /// True when some READY agent of `tier` lists `task_type`.
    pub fn is_routable(&self, task_type: &str, tier: Option<wire::AgentTier>) -> bool {
        self.agents.values().any(|e| {
            e.is_ready()
                && e.descriptor.can_handle(task_type)
                && tier.map(|t| e.descriptor.tier == t).unwrap_or(true)
        })
    }
}

/// Tracks live agents, their health, and capacity.
pub struct Registry {
    inner: RwLock<Arc<Snapshot>>,
    started: Instant,
    heartbeat_interval: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new(heartbeat_interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: RwLock::new(Arc::new(Snapshot {
                epoch: 0,
                agents: HashMap::new(),
            })),
            started: Instant::now(),
            heartbeat_interval,
            events,
        })
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Lock-free read of the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot().epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Serialized write path: transform the agent map, bump the epoch,
    /// publish a new snapshot.
    fn mutate<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut HashMap<String, Arc<AgentEntry>>) -> T,
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut agents = guard.agents.clone();
        let out = f(&mut agents);
        *guard = Arc::new(Snapshot {
            epoch: guard.epoch + 1,
            agents,
        });
        out
    }

    /// Registers an agent. Duplicate ids are rejected unless the prior
    /// descriptor is GONE; capabilities are immutable for the connection
    /// lifetime, so changes go through deregister + register.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<u64, RegistryError> {
        let now_ms = self.now_ms();
        let agent_id = descriptor.agent_id.clone();
        let result = self.mutate(|agents| match agents.get(&agent_id) {
            Some(existing) if existing.health != HealthState::Gone => {
                Err(RegistryError::Duplicate(agent_id.clone()))
            }
            _ => {
                agents.insert(agent_id.clone(), Arc::new(AgentEntry::new(descriptor, now_ms)));
                Ok(())
            }
        });
        result?;
        tracing::info!(agent_id = %agent_id, "agent registered");
        let _ = self.events.send(RegistryEvent::Registered(agent_id));
        Ok(self.epoch())
    }

    /// Marks the agent GONE. In-flight tasks routed to it are the transport
    /// hub's problem; it reacts to the broadcast event.
    pub fn deregister(&self, agent_id: &str) -> Result<(), RegistryError> {
        let result = self.mutate(|agents| match agents.get(agent_id) {
            None => Err(RegistryError::NotFound(agent_id.to_string())),
            Some(entry) => {
                let gone = Arc::new(entry.with_health(HealthState::Gone));
                agents.insert(agent_id.to_string(), gone);
                Ok(())
            }
        });
        result?;
        tracing::info!(agent_id = %agent_id, "agent deregistered");
        let _ = self
            .events
            .send(RegistryEvent::Deregistered(agent_id.to_string()));
        Ok(())
    }

    /// Transitions among READY / DRAINING / UNHEALTHY. UNHEALTHY is sticky:
    /// only a successful heartbeat clears it, so READY requests from other
    /// paths are ignored while unhealthy.
    pub fn set_health(&self, agent_id: &str, health: HealthState) -> Result<(), RegistryError> {
        let changed = self.mutate(|agents| match agents.get(agent_id) {
            None => Err(RegistryError::NotFound(agent_id.to_string())),
            Some(entry) if entry.health == HealthState::Gone => {
                Err(RegistryError::Gone(agent_id.to_string()))
            }
            Some(entry) => {
                if entry.health == HealthState::Unhealthy && health == HealthState::Ready {
                    return Ok(false);
                }
                if entry.health == health {
                    return Ok(false);
                }
                let updated = Arc::new(entry.with_health(health));
                agents.insert(agent_id.to_string(), updated);
                Ok(true)
            }
        })?;
        if changed {
            tracing::debug!(agent_id = %agent_id, health = ?health, "agent health changed");
            let _ = self
                .events
                .send(RegistryEvent::HealthChanged(agent_id.to_string(), health));
        }
        Ok(())
    }

    /// Records a heartbeat; a successful heartbeat clears sticky UNHEALTHY.
    pub fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let snapshot = self.snapshot();
        let entry = snapshot
            .get(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        if entry.health == HealthState::Gone {
            return Err(RegistryError::Gone(agent_id.to_string()));
        }
        entry.last_heartbeat_ms.store(self.now_ms(), Ordering::SeqCst);
        if entry.health == HealthState::Unhealthy {
            // Direct write path: set_health keeps UNHEALTHY sticky on purpose.
            self.mutate(|agents| {
                if let Some(entry) = agents.get(agent_id) {
                    if entry.health == HealthState::Unhealthy {
                        let updated = Arc::new(entry.with_health(HealthState::Ready));
                        agents.insert(agent_id.to_string(), updated);
                    }
                }
            });
            let _ = self.events.send(RegistryEvent::HealthChanged(
                agent_id.to_string(),
                HealthState::Ready,
            ));
        }
        Ok(())
    }

    /// Moves agents silent for 3× the heartbeat interval to UNHEALTHY.
    pub fn sweep_missed_heartbeats(&self) {
        let cutoff_ms = self.heartbeat_interval.as_millis() as u64 * u64::from(HEARTBEAT_GRACE_INTERVALS);
        let now_ms = self.now_ms();
        let snapshot = self.snapshot();
        for entry in snapshot.iter() {
            if !matches!(entry.health, HealthState::Ready | HealthState::Draining) {
                continue;
            }
            let last = entry.last_heartbeat_ms.load(Ordering::SeqCst);
            if now_ms.saturating_sub(last) > cutoff_ms {
                tracing::warn!(agent_id = %entry.agent_id(), "heartbeats missed; marking unhealthy");
                let _ = self.set_health(entry.agent_id(), HealthState::Unhealthy);
            }
        }
    }

    /// Background sweep at the heartbeat interval until cancelled.
    pub fn spawn_heartbeat_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => registry.sweep_missed_heartbeats(),
                }
            }
        })
    }
}
