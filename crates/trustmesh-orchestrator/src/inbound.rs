use std::sync::Arc;

use async_trait::async_trait;

use trustmesh_broker::{ConsumerId, Delivery, DeliveryHandler, HandlerError};
use trustmesh_types::{AgentMessage, Result, decode};

use crate::orchestrator::Orchestrator;

/// Feeds agent messages from the inbound queue into the orchestrator.
///
/// Undecodable bodies are permanent errors, so the broker dead-letters them
/// instead of redelivering.
pub struct InboundHandler {
    orchestrator: Arc<Orchestrator>,
}

impl InboundHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl DeliveryHandler for InboundHandler {
    async fn handle(&self, delivery: &Delivery) -> std::result::Result<(), HandlerError> {
        let message: AgentMessage = decode(&delivery.body)?;
        self.orchestrator.handle_message(message).await?;
        Ok(())
    }
}

impl Orchestrator {
    /// Start consuming the inbound agent queue.
    pub async fn start_inbound(self: &Arc<Self>) -> Result<ConsumerId> {
        let queue = self.config().routes.inbound.clone();
        let handler = Arc::new(InboundHandler::new(Arc::clone(self)));
        let id = self.broker().consume(&queue, handler).await?;
        tracing::info!(queue = %queue, "Consuming agent messages");
        Ok(id)
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use trustmesh_broker::{ChannelManager, ChannelManagerConfig, InMemoryBroker};
    use trustmesh_types::{ResultEnvelope, TaskState, encode};
    use uuid::Uuid;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::memory::InMemoryTaskStore;
    use crate::orchestrator::{DispatchOutcome, TaskSpec};
    use crate::registry::TaskKindSpec;

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_inbound_messages_drive_tasks() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(ChannelManager::new(
            Arc::new(broker.clone()),
            ChannelManagerConfig::default(),
        ));
        manager.start();
        manager
            .wait_connected(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(InMemoryTaskStore::new()),
            manager,
        ));
        orchestrator.registry().register(TaskKindSpec::new("analyze"));
        orchestrator.start_inbound().await.unwrap();

        let agent_id = Uuid::new_v4();
        let heartbeat = AgentMessage::Heartbeat {
            agent_id,
            capabilities: None,
            max_concurrency: Some(2),
        };
        broker.inject("agents.inbound", encode(&heartbeat).unwrap());
        wait_until(|| orchestrator.pool().get(agent_id).is_some()).await;

        let ticket = orchestrator
            .submit_task(TaskSpec::new("analyze", vec![]))
            .await
            .unwrap();
        let outcome = orchestrator.dispatch_next().await.unwrap();
        assert!(matches!(outcome, Some(DispatchOutcome::Dispatched { .. })));

        let started = AgentMessage::Started {
            task_id: ticket.task_id,
            agent_id,
            attempt: 1,
        };
        broker.inject("agents.inbound", encode(&started).unwrap());
        let finished = AgentMessage::Finished(ResultEnvelope::success(
            ticket.task_id,
            agent_id,
            1,
            b"ok".to_vec(),
        ));
        broker.inject("agents.inbound", encode(&finished).unwrap());

        let notice = ticket
            .wait(Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(notice.state(), TaskState::Completed);

        broker.inject("agents.inbound", b"not json".to_vec());
        wait_until(|| broker.queue_depth("dead-letter") == 1).await;
    }
}
