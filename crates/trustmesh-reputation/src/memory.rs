use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use trustmesh_types::Result;

use crate::matrix::{Observation, TrustVector};
use crate::store::ReputationStore;

/// In-memory reputation store (default).
#[derive(Debug, Clone, Default)]
pub struct InMemoryReputationStore {
    observations: Arc<RwLock<Vec<Observation>>>,
    vector: Arc<RwLock<Option<TrustVector>>>,
}

impl InMemoryReputationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observation_count(&self) -> usize {
        self.observations.read().await.len()
    }
}

#[async_trait]
impl ReputationStore for InMemoryReputationStore {
    async fn load_trust_vector(&self) -> Result<Option<TrustVector>> {
        Ok(self.vector.read().await.clone())
    }

    async fn record_observation(&self, observation: &Observation) -> Result<()> {
        self.observations.write().await.push(observation.clone());
        Ok(())
    }

    async fn persist_trust_vector(&self, vector: &TrustVector) -> Result<()> {
        *self.vector.write().await = Some(vector.clone());
        Ok(())
    }

    async fn load_observations(&self) -> Result<Vec<Observation>> {
        Ok(self.observations.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_round_trip() {
        let store = InMemoryReputationStore::new();
        assert!(store.load_trust_vector().await.unwrap().is_none());

        let obs = Observation::new(Uuid::new_v4(), Uuid::new_v4(), 1.0);
        store.record_observation(&obs).await.unwrap();
        assert_eq!(store.load_observations().await.unwrap(), vec![obs]);

        let vector = TrustVector::uniform(&[Uuid::new_v4(), Uuid::new_v4()]);
        store.persist_trust_vector(&vector).await.unwrap();
        assert_eq!(store.load_trust_vector().await.unwrap(), Some(vector));
    }
}
