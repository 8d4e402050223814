//! # mcp
//!
//! The Cartrita Master Control Program orchestrator: tier-0 gateway and
//! message fabric routing client tasks through a supervisor hierarchy to
//! specialized sub-agents, with per-task budgets, cancellation, streaming,
//! and end-to-end correlation.
//!
//! ## Main modules
//!
//! - [`transport`]: Unix-socket and in-process connections, wire framing,
//!   the hub ([`TransportHub`]) that routes by recipient.
//! - [`registry`]: live agents behind epoch-stamped immutable snapshots
//!   ([`Registry`], [`AgentEntry`]).
//! - [`router`]: capability/load/cost/latency/affinity scoring with a
//!   bounded saturation queue ([`Router`]).
//! - [`graph`]: the supervisor star graph — state-in/state-out hops,
//!   delegation depth, termination ([`GraphRunner`], [`TurnState`]).
//! - [`executor`]: per-task owner — retries, exactly-once dedup, stream
//!   reassembly, cancellation ([`TaskExecutor`]).
//! - [`budget`]: budget accumulators and sliding-window rate limits
//!   ([`BudgetGuard`], [`RateLimiter`]).
//! - [`auth`]: the security gate ([`SecurityGate`], [`Principal`]).
//! - [`trace`]: correlation/trace context ([`TraceContext`]).
//! - [`store`]: the opaque byte store the core persists through
//!   ([`StateStore`], [`InMemoryStateStore`]).
//! - [`orchestrator`]: the assembled gateway ([`Orchestrator`]).
//!
//! Process-wide wiring happens in the entry point; every component receives
//! its collaborators explicitly.

pub mod auth;
pub mod budget;
pub mod config;
pub mod context;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod store;
pub mod stream;
pub mod trace;
pub mod transport;

pub use auth::{AuthError, Principal, SecurityGate};
pub use budget::{BudgetGuard, GuardError, RateKey, RateLimiter, RateLimits};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::RequestContext;
pub use executor::{ExecutorConfig, StreamItem, TaskExecutor};
pub use graph::{Decision, GraphRunner, HopDriver, HopError, StateDelta, SupervisorTurn, TurnState};
pub use orchestrator::Orchestrator;
pub use registry::{AgentEntry, Registry, RegistryError, RegistryEvent, Snapshot};
pub use router::{RouteError, Router, RouterConfig, RouterWeights};
pub use store::{InMemoryStateStore, StateStore, StoreError, IDEMPOTENCY_TTL};
pub use stream::{ReassemblyBuffer, StreamError};
pub use trace::TraceContext;
pub use transport::{
    connect_in_process, drive_connection, InProcessConn, McpCodec, TransportError, TransportHub,
    UdsServer,
};
