use std::collections::BTreeMap;

use trustmesh_reputation::{EigenTrustEngine, TrustSnapshot};
use trustmesh_types::AgentId;

/// Where ballot weights come from. Reads must not block: voting resolves the
/// weight once, at cast time.
pub trait WeightSource: Send + Sync {
    /// Unknown voters weigh 0.0.
    fn weight_of(&self, voter: &AgentId) -> f64;
}

impl WeightSource for EigenTrustEngine {
    fn weight_of(&self, voter: &AgentId) -> f64 {
        EigenTrustEngine::weight_of(self, voter)
    }
}

impl WeightSource for TrustSnapshot {
    fn weight_of(&self, voter: &AgentId) -> f64 {
        TrustSnapshot::weight_of(self, voter)
    }
}

/// Fixed weights, for deployments without a reputation engine.
impl WeightSource for BTreeMap<AgentId, f64> {
    fn weight_of(&self, voter: &AgentId) -> f64 {
        self.get(voter).copied().unwrap_or(0.0)
    }
}
