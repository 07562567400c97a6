use std::time::Duration;

use chrono::{DateTime, Utc};
use trustmesh_types::BackoffPolicy;

use crate::circuit_breaker::CircuitBreakerConfig;

/// Broker routes used by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    /// Dispatches go to `<prefix>.<agent id>`.
    pub dispatch_prefix: String,
    pub results: String,
    pub dead_letter: String,
    /// Queue agents report `Started`, `Finished` and `Heartbeat` on.
    pub inbound: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            dispatch_prefix: "tasks.dispatch".into(),
            results: "tasks.results".into(),
            dead_letter: "tasks.dead-letter".into(),
            inbound: "agents.inbound".into(),
        }
    }
}

impl RouteConfig {
    pub fn dispatch_route(&self, agent_id: &uuid::Uuid) -> String {
        format!("{}.{}", self.dispatch_prefix, agent_id)
    }
}

/// Configuration for the task orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a dispatched task may wait for the agent's `Started`.
    pub ack_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub dispatch_interval: Duration,
    pub default_max_attempts: u32,
    pub retry: BackoffPolicy,
    pub circuit: CircuitBreakerConfig,
    pub routes: RouteConfig,
    /// Bound on waiting for the broker when publishing.
    pub publish_timeout: Duration,
    /// Fewer active agents than this reports `Degraded`.
    pub min_active_agents: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            dispatch_interval: Duration::from_millis(250),
            default_max_attempts: 3,
            retry: BackoffPolicy::moderate(),
            circuit: CircuitBreakerConfig::default(),
            routes: RouteConfig::default(),
            publish_timeout: Duration::from_secs(5),
            min_active_agents: 1,
        }
    }
}

/// Convert a configured duration, saturating at the largest chrono can hold.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `now + d`, clamped to the last representable instant.
pub(crate) fn later(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - d`, clamped to the first representable instant.
pub(crate) fn earlier(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_durations_saturate() {
        let now = Utc::now();
        let forever = Duration::from_secs(u64::MAX);
        assert_eq!(chrono_duration(forever), chrono::Duration::MAX);
        assert_eq!(later(now, forever), DateTime::<Utc>::MAX_UTC);
        assert_eq!(earlier(now, forever), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_ordinary_durations_convert_exactly() {
        let now = Utc::now();
        let d = Duration::from_millis(1500);
        assert_eq!(later(now, d) - now, chrono::Duration::milliseconds(1500));
        assert_eq!(now - earlier(now, d), chrono::Duration::milliseconds(1500));
    }
}
