//! Supervisor graph: one supervisor node and N sub-agents in a star.
//!
//! Entry is always the supervisor; every sub-agent hop returns control to it
//! unconditionally. State flows state-in, state-out: each hop derives a new
//! value from the prior one plus the hop's delta.

mod decision;
mod runner;
mod state;

pub use decision::{Decision, SupervisorTurn};
pub use runner::{GraphOutcome, GraphRunner, HopDriver, HopError};
pub use state::{ChatMessage, StateDelta, TurnState, END, SUPERVISOR_ROLE, USER_ROLE};
