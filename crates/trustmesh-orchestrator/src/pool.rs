use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use trustmesh_types::{AgentDescriptor, AgentId, AgentStatus, Result, TrustmeshError};

/// The set of agents known to the orchestrator.
///
/// Each descriptor sits behind its own map entry, so reservations on different
/// agents never contend. `inflight_count` is only changed here.
#[derive(Default)]
pub struct AgentPool {
    agents: DashMap<AgentId, AgentDescriptor>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agent, keeping the in-flight count of a known one.
    pub fn register(&self, mut agent: AgentDescriptor) {
        if let Some(existing) = self.agents.get(&agent.id) {
            agent.inflight_count = existing.inflight_count;
        }
        tracing::info!(agent_id = %agent.id, capabilities = ?agent.capabilities, "Agent registered");
        self.agents.insert(agent.id, agent);
    }

    pub fn remove(&self, agent_id: AgentId) -> Option<AgentDescriptor> {
        self.agents.remove(&agent_id).map(|(_, agent)| agent)
    }

    pub fn get(&self, agent_id: AgentId) -> Option<AgentDescriptor> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Active)
            .count()
    }

    /// Record a heartbeat. Unknown agents are registered; an unreachable
    /// agent becomes active again. Returns true when the agent was new.
    pub fn heartbeat(
        &self,
        agent_id: AgentId,
        capabilities: Option<BTreeSet<String>>,
        max_concurrency: Option<u32>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut created = false;
        let mut agent = self.agents.entry(agent_id).or_insert_with(|| {
            created = true;
            AgentDescriptor::new(agent_id)
        });
        agent.last_heartbeat = now;
        if let Some(capabilities) = capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(limit) = max_concurrency {
            agent.max_concurrency = limit.max(1);
        }
        if agent.status == AgentStatus::Unreachable {
            tracing::info!(agent_id = %agent_id, "Agent reachable again");
            agent.status = AgentStatus::Active;
        }
        created
    }

    pub fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(TrustmeshError::AgentNotFound(agent_id))?;
        agent.status = status;
        Ok(())
    }

    /// Reserve a slot on the least-loaded active agent whose capabilities
    /// cover `required`; ties go to the smallest agent id.
    pub fn try_reserve(&self, required: &BTreeSet<String>) -> Option<AgentId> {
        let mut candidates: Vec<(u32, AgentId)> = self
            .agents
            .iter()
            .filter(|a| a.accepts_work() && a.satisfies(required))
            .map(|a| (a.inflight_count, a.id))
            .collect();
        candidates.sort();

        // Another reservation may have raced us; re-check under the entry lock.
        candidates.into_iter().find_map(|(_, id)| {
            let mut agent = self.agents.get_mut(&id)?;
            if agent.accepts_work() && agent.satisfies(required) {
                agent.inflight_count += 1;
                Some(id)
            } else {
                None
            }
        })
    }

    /// Give back a slot taken by `try_reserve`.
    pub fn release(&self, agent_id: AgentId) {
        if let Some(mut agent) = self.agents.get_mut(&agent_id) {
            agent.inflight_count = agent.inflight_count.saturating_sub(1);
        }
    }

    /// Mark agents whose last heartbeat is older than `timeout` unreachable.
    /// Returns the agents that changed.
    pub fn expire_heartbeats(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<AgentId> {
        let timeout = crate::config::chrono_duration(timeout);
        let mut expired = Vec::new();
        for mut agent in self.agents.iter_mut() {
            if agent.status != AgentStatus::Unreachable && now - agent.last_heartbeat > timeout {
                agent.status = AgentStatus::Unreachable;
                expired.push(agent.id);
            }
        }
        for id in &expired {
            tracing::warn!(agent_id = %id, "Agent heartbeat expired, marked unreachable");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn caps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reserve_prefers_least_loaded_then_id() {
        let pool = AgentPool::new();
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        for id in ids {
            pool.register(
                AgentDescriptor::new(id)
                    .with_capabilities(["nlp"])
                    .with_max_concurrency(2),
            );
        }

        assert_eq!(pool.try_reserve(&caps(&["nlp"])), Some(ids[0]), "tie broken by id");
        assert_eq!(pool.try_reserve(&caps(&["nlp"])), Some(ids[1]), "least loaded wins");
        assert_eq!(pool.try_reserve(&caps(&["nlp"])), Some(ids[0]));
        assert_eq!(pool.try_reserve(&caps(&["nlp"])), Some(ids[1]));
        assert_eq!(pool.try_reserve(&caps(&["nlp"])), None, "all agents at capacity");

        pool.release(ids[1]);
        assert_eq!(pool.try_reserve(&caps(&["nlp"])), Some(ids[1]));
    }

    #[test]
    fn test_reserve_requires_capability_superset() {
        let pool = AgentPool::new();
        let agent = AgentDescriptor::random().with_capabilities(["nlp"]);
        let id = agent.id;
        pool.register(agent);

        assert_eq!(pool.try_reserve(&caps(&["nlp", "gpu"])), None);
        assert_eq!(pool.try_reserve(&caps(&[])), Some(id));
    }

    #[test]
    fn test_draining_and_unreachable_agents_are_skipped() {
        let pool = AgentPool::new();
        let agent = AgentDescriptor::random();
        let id = agent.id;
        pool.register(agent);

        pool.set_status(id, AgentStatus::Draining).unwrap();
        assert_eq!(pool.try_reserve(&BTreeSet::new()), None);
        pool.set_status(id, AgentStatus::Active).unwrap();
        assert_eq!(pool.try_reserve(&BTreeSet::new()), Some(id));
        assert!(pool.set_status(Uuid::new_v4(), AgentStatus::Active).is_err());
    }

    #[test]
    fn test_heartbeat_expiry_and_recovery() {
        let pool = AgentPool::new();
        let id = Uuid::new_v4();
        let start = Utc::now();
        assert!(pool.heartbeat(id, Some(caps(&["nlp"])), Some(4), start));
        assert_eq!(pool.get(id).unwrap().max_concurrency, 4);

        let later = start + chrono::Duration::seconds(120);
        assert_eq!(pool.expire_heartbeats(later, Duration::from_secs(60)), vec![id]);
        assert_eq!(pool.get(id).unwrap().status, AgentStatus::Unreachable);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.expire_heartbeats(later, Duration::from_secs(60)).is_empty());

        assert!(!pool.heartbeat(id, None, None, later));
        assert_eq!(pool.get(id).unwrap().status, AgentStatus::Active);
        assert!(pool.get(id).unwrap().has_capability("nlp"));
    }

    #[test]
    fn test_concurrent_reservations_respect_capacity() {
        let pool = std::sync::Arc::new(AgentPool::new());
        pool.register(AgentDescriptor::random().with_max_concurrency(10));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .filter(|_| pool.try_reserve(&BTreeSet::new()).is_some())
                        .count()
                })
            })
            .collect();
        let reserved: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(reserved, 10);
    }
}
