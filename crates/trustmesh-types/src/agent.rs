use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AgentId;

/// Lifecycle status of an agent in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Accepting new work.
    Active,
    /// Finishing in-flight work, not accepting new tasks.
    Draining,
    /// Heartbeat expired.
    Unreachable,
}

/// A worker process known to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub inflight_count: u32,
    pub max_concurrency: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentDescriptor {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            capabilities: BTreeSet::new(),
            status: AgentStatus::Active,
            inflight_count: 0,
            max_concurrency: 1,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrency(mut self, limit: u32) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    /// True when the agent's capability set is a superset of `required`.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn has_capacity(&self) -> bool {
        self.inflight_count < self.max_concurrency
    }

    /// Whether a new task may be reserved on this agent.
    pub fn accepts_work(&self) -> bool {
        self.status == AgentStatus::Active && self.has_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superset_matching() {
        let agent = AgentDescriptor::random().with_capabilities(["gpu", "nlp", "vision"]);
        let required: BTreeSet<String> = ["gpu", "nlp"].into_iter().map(String::from).collect();
        assert!(agent.satisfies(&required));

        let missing: BTreeSet<String> = ["audio"].into_iter().map(String::from).collect();
        assert!(!agent.satisfies(&missing));
        assert!(agent.satisfies(&BTreeSet::new()));
    }

    #[test]
    fn test_accepts_work() {
        let mut agent = AgentDescriptor::random().with_max_concurrency(2);
        assert!(agent.accepts_work());
        agent.inflight_count = 2;
        assert!(!agent.accepts_work());
        agent.inflight_count = 0;
        agent.status = AgentStatus::Draining;
        assert!(!agent.accepts_work());
    }

    #[test]
    fn test_max_concurrency_floor() {
        let agent = AgentDescriptor::random().with_max_concurrency(0);
        assert_eq!(agent.max_concurrency, 1);
    }
}
