//! Agent descriptor: what an agent declares about itself when registering.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::context::ResourceLimits;

/// Role in the hierarchy: supervisors plan, subs execute bounded tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentTier {
    Supervisor,
    Sub,
}

/// Registry health states. UNHEALTHY is sticky until a successful heartbeat;
/// GONE descriptors may be replaced by a fresh registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Ready,
    Draining,
    Unhealthy,
    Gone,
}

fn default_max_concurrent() -> u32 {
    1
}

/// What an agent declares in its `register` event. Capabilities are immutable
/// for the connection lifetime; changing them requires re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub tier: AgentTier,
    /// task_type tags this agent services.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub routing_tags: BTreeSet<String>,
    /// Tools a sub-agent may invoke; everything else is denied.
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Router scoring hint: typical cost of one invocation.
    #[serde(default)]
    pub cost_per_call_usd: Option<f64>,
    /// Router scoring hint: typical end-to-end latency.
    #[serde(default)]
    pub avg_latency_ms: Option<u64>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<String>, tier: AgentTier) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier,
            capabilities: BTreeSet::new(),
            routing_tags: BTreeSet::new(),
            allowed_tools: BTreeSet::new(),
            max_concurrent: default_max_concurrent(),
            cost_per_call_usd: None,
            avg_latency_ms: None,
            resource_limits: None,
        }
    }

    pub fn with_capability(mut self, task_type: impl Into<String>) -> Self {
        self.capabilities.insert(task_type.into());
        self
    }

    pub fn with_routing_tag(mut self, tag: impl Into<String>) -> Self {
        self.routing_tags.insert(tag.into());
        self
    }

    pub fn with_allowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.insert(tool.into());
        self
    }

    pub fn with_max_concurrent(mut self, cap: u32) -> Self {
        self.max_concurrent = cap;
        self
    }

    pub fn with_cost_hint(mut self, cost_per_call_usd: f64) -> Self {
        self.cost_per_call_usd = Some(cost_per_call_usd);
        self
    }

    pub fn with_latency_hint(mut self, avg_latency_ms: u64) -> Self {
        self.avg_latency_ms = Some(avg_latency_ms);
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder_and_capability_check() {
        let d = AgentDescriptor::new("echo-1", AgentTier::Sub)
            .with_capability("echo")
            .with_allowed_tool("string.reverse")
            .with_max_concurrent(4);
        assert!(d.can_handle("echo"));
        assert!(!d.can_handle("compute"));
        assert_eq!(d.max_concurrent, 4);
    }

    #[test]
    fn tier_wire_casing() {
        assert_eq!(
            serde_json::to_value(AgentTier::Supervisor).unwrap(),
            "SUPERVISOR"
        );
        assert_eq!(serde_json::to_value(HealthState::Gone).unwrap(), "GONE");
    }
}
