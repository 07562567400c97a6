use async_trait::async_trait;

use trustmesh_types::Result;

use crate::matrix::{Observation, TrustVector};

/// Durable home of the interaction log and the last computed trust vector.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// The last persisted trust vector, if any.
    async fn load_trust_vector(&self) -> Result<Option<TrustVector>>;

    async fn record_observation(&self, observation: &Observation) -> Result<()>;

    async fn persist_trust_vector(&self, vector: &TrustVector) -> Result<()>;

    /// Every recorded observation, oldest first. Used to rebuild the
    /// interaction log at startup.
    async fn load_observations(&self) -> Result<Vec<Observation>>;
}
