use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use trustmesh_broker::{BrokerTransport, ChannelManager, InMemoryBroker};
use trustmesh_orchestrator::{InMemoryTaskStore, Orchestrator, TaskStore};
use trustmesh_reputation::{EigenTrustEngine, InMemoryReputationStore, ReputationStore};
use trustmesh_voting::VotingEngine;

use crate::config::{BrokerBackend, NodeConfig};

/// How long startup waits for the first broker connection before carrying on
/// in the background.
const CONNECT_GRACE: Duration = Duration::from_secs(10);

/// The four subsystems wired together.
pub struct Node {
    config: NodeConfig,
    broker: Arc<ChannelManager>,
    orchestrator: Arc<Orchestrator>,
    reputation: Arc<EigenTrustEngine>,
    voting: Arc<VotingEngine>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build a node with in-memory stores and the configured broker backend.
    pub fn build(config: NodeConfig) -> Result<Self> {
        let transport = transport_for(&config)?;
        Self::build_with(
            config,
            transport,
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryReputationStore::new()),
        )
    }

    pub fn build_with(
        config: NodeConfig,
        transport: Arc<dyn BrokerTransport>,
        task_store: Arc<dyn TaskStore>,
        reputation_store: Arc<dyn ReputationStore>,
    ) -> Result<Self> {
        let broker = Arc::new(ChannelManager::new(
            transport,
            config.broker.manager_config(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.orchestrator_config()?,
            task_store,
            broker.clone(),
        ));
        for kind in &config.orchestrator.kinds {
            orchestrator.registry().register(kind.clone());
        }

        let reputation = Arc::new(EigenTrustEngine::new(
            config.reputation.clone(),
            reputation_store,
        ));
        let voting = Arc::new(
            VotingEngine::new(config.voting.clone(), reputation.clone()).with_broker(broker.clone()),
        );

        Ok(Self {
            config,
            broker,
            orchestrator,
            reputation,
            voting,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ChannelManager> {
        &self.broker
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn reputation(&self) -> &Arc<EigenTrustEngine> {
        &self.reputation
    }

    pub fn voting(&self) -> &Arc<VotingEngine> {
        &self.voting
    }

    /// Connect, recover persisted state, and start the background loops.
    pub async fn start(&mut self) -> Result<()> {
        self.handles.push(self.broker.start());
        if let Err(e) = self
            .broker
            .wait_connected(CONNECT_GRACE, &self.shutdown)
            .await
        {
            tracing::warn!("Broker not connected yet, continuing: {}", e);
        }

        self.reputation
            .load()
            .await
            .context("Failed to load reputation state")?;
        let recovered = self
            .orchestrator
            .recover()
            .await
            .context("Failed to recover tasks")?;
        self.orchestrator
            .start_inbound()
            .await
            .context("Failed to consume agent messages")?;

        self.handles.push(tokio::spawn(
            self.orchestrator.clone().run(self.shutdown.child_token()),
        ));
        self.handles.push(tokio::spawn(
            self.reputation.clone().run(self.shutdown.child_token()),
        ));
        self.handles.push(tokio::spawn(
            self.voting.clone().run(self.shutdown.child_token()),
        ));

        tracing::info!(
            kinds = ?self.orchestrator.registry().kinds(),
            requeued = recovered.requeued,
            "Node started"
        );
        Ok(())
    }

    /// Close open voting sessions, stop the loops and close the broker
    /// connection.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.voting.shutdown().await;
        self.broker.shutdown().await;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node stopped");
    }
}

fn transport_for(config: &NodeConfig) -> Result<Arc<dyn BrokerTransport>> {
    match config.broker.backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerBackend::Amqp => Ok(Arc::new(trustmesh_broker::AmqpTransport::new(
            config.broker.uri.clone(),
        ))),
        #[cfg(not(feature = "amqp"))]
        BrokerBackend::Amqp => {
            anyhow::bail!("AMQP backend requested but trustmesh was built without the `amqp` feature")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustmesh_orchestrator::HealthStatus;

    #[tokio::test]
    async fn test_node_starts_and_stops() {
        let mut node = Node::build(NodeConfig::default()).unwrap();
        node.start().await.unwrap();
        assert!(node.broker().state().is_usable());
        assert_eq!(
            node.orchestrator().health().status,
            HealthStatus::Degraded,
            "no agents yet"
        );
        node.shutdown().await;
    }

    #[cfg(not(feature = "amqp"))]
    #[test]
    fn test_amqp_backend_requires_feature() {
        let mut config = NodeConfig::default();
        config.broker.backend = BrokerBackend::Amqp;
        assert!(Node::build(config).is_err());
    }
}
