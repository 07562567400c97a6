use std::collections::HashMap;

use tokio::sync::oneshot;

use trustmesh_types::TaskId;

use crate::error::BrokerError;
use crate::transport::{BrokerChannel, Confirm, OutboundMessage};

/// How a tracked publish was finally resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The connection dropped before the broker answered.
    Unconfirmed,
}

struct PendingConfirm {
    task_id: Option<TaskId>,
    tx: oneshot::Sender<ConfirmOutcome>,
}

/// One logical channel owned by the channel manager.
///
/// Publishes in confirm mode are tracked by delivery tag until the broker acks
/// or nacks them, or until the lease is invalidated.
pub struct ChannelLease {
    pub connection_id: u64,
    pub channel_id: u16,
    pub confirm_mode: bool,
    pending_confirms: HashMap<u64, PendingConfirm>,
    channel: Box<dyn BrokerChannel>,
    valid: bool,
}

impl ChannelLease {
    pub fn new(connection_id: u64, channel: Box<dyn BrokerChannel>, confirm_mode: bool) -> Self {
        Self {
            connection_id,
            channel_id: channel.channel_id(),
            confirm_mode,
            pending_confirms: HashMap::new(),
            channel,
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn channel_mut(&mut self) -> &mut dyn BrokerChannel {
        self.channel.as_mut()
    }

    /// Publish through this lease. In confirm mode the returned receiver
    /// resolves once the broker answers or the lease is invalidated.
    pub async fn publish(
        &mut self,
        message: OutboundMessage,
        task_id: Option<TaskId>,
    ) -> Result<(u64, Option<oneshot::Receiver<ConfirmOutcome>>), BrokerError> {
        if !self.valid {
            return Err(BrokerError::ConnectionLost(self.connection_id));
        }
        let delivery_tag = self.channel.publish(message).await?;
        if !self.confirm_mode {
            return Ok((delivery_tag, None));
        }
        let (tx, rx) = oneshot::channel();
        self.pending_confirms
            .insert(delivery_tag, PendingConfirm { task_id, tx });
        Ok((delivery_tag, Some(rx)))
    }

    /// Route a broker confirm to the publisher waiting on it.
    pub fn resolve(&mut self, confirm: Confirm) -> bool {
        match self.pending_confirms.remove(&confirm.delivery_tag) {
            Some(pending) => {
                let outcome = if confirm.ack {
                    ConfirmOutcome::Ack
                } else {
                    ConfirmOutcome::Nack
                };
                let _ = pending.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a delivery whose publisher gave up waiting.
    pub fn forget(&mut self, delivery_tag: u64) -> Option<TaskId> {
        self.pending_confirms
            .remove(&delivery_tag)
            .and_then(|p| p.task_id)
    }

    /// Mark the lease dead and resolve every pending publish as unconfirmed.
    /// Returns the task ids that were awaiting confirmation.
    pub fn invalidate(&mut self) -> Vec<Option<TaskId>> {
        self.valid = false;
        self.pending_confirms
            .drain()
            .map(|(_, pending)| {
                let _ = pending.tx.send(ConfirmOutcome::Unconfirmed);
                pending.task_id
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_confirms.len()
    }

    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.pending_confirms
            .values()
            .filter_map(|p| p.task_id)
            .collect()
    }
}

#[cfg(all(test, feature = "memory-broker"))]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::transport::BrokerTransport;
    use uuid::Uuid;

    async fn lease(broker: &InMemoryBroker) -> (ChannelLease, tokio::sync::mpsc::UnboundedReceiver<Confirm>) {
        let conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        let confirms = channel.enable_confirms().await.unwrap();
        (ChannelLease::new(1, channel, true), confirms)
    }

    #[tokio::test]
    async fn test_confirm_resolves_pending() {
        let broker = InMemoryBroker::new();
        let (mut lease, mut confirms) = lease(&broker).await;
        let task_id = Uuid::new_v4();

        let (tag, rx) = lease
            .publish(OutboundMessage::new("work", b"hi".to_vec()), Some(task_id))
            .await
            .unwrap();
        assert_eq!(lease.pending_tasks(), vec![task_id]);

        let confirm = confirms.recv().await.unwrap();
        assert_eq!(confirm.delivery_tag, tag);
        assert!(lease.resolve(confirm));
        assert_eq!(rx.unwrap().await.unwrap(), ConfirmOutcome::Ack);
        assert_eq!(lease.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_resolves_unconfirmed() {
        let broker = InMemoryBroker::new();
        broker.withhold_confirms(true);
        let (mut lease, _confirms) = lease(&broker).await;
        let task_id = Uuid::new_v4();

        let (_, rx) = lease
            .publish(OutboundMessage::new("work", vec![]), Some(task_id))
            .await
            .unwrap();
        let dropped = lease.invalidate();
        assert_eq!(dropped, vec![Some(task_id)]);
        assert_eq!(rx.unwrap().await.unwrap(), ConfirmOutcome::Unconfirmed);
        assert!(!lease.is_valid());

        let err = lease
            .publish(OutboundMessage::new("work", vec![]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost(1)));
    }

    #[tokio::test]
    async fn test_forget_drops_tracking() {
        let broker = InMemoryBroker::new();
        broker.withhold_confirms(true);
        let (mut lease, _confirms) = lease(&broker).await;
        let task_id = Uuid::new_v4();
        let (tag, _rx) = lease
            .publish(OutboundMessage::new("work", vec![]), Some(task_id))
            .await
            .unwrap();
        assert_eq!(lease.forget(tag), Some(task_id));
        assert_eq!(lease.pending_count(), 0);
        assert!(!lease.resolve(Confirm { delivery_tag: tag, ack: true }));
    }
}
