//! In-process broker used for tests and single-node runs.
//!
//! Implements queue semantics close enough to AMQP 0-9-1 for the channel
//! manager: per-channel delivery tags, publisher confirms, prefetch-bounded
//! manual acknowledgment, and requeue of unacked messages when a connection
//! drops. Fault-injection hooks simulate broker outages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::BrokerError;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Confirm, Delivery, Headers, OutboundMessage,
};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub delivery_count: u32,
}

struct ConsumerSlot {
    connection_id: u64,
    channel_id: u16,
    prefetch: usize,
    outstanding: usize,
    next_tag: Arc<AtomicU64>,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

struct ConnectionShared {
    id: u64,
    closed: watch::Sender<bool>,
    next_channel: AtomicU16,
}

impl ConnectionShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[derive(Default)]
struct CoreState {
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
    unacked: HashMap<(u64, u16, u64), Unacked>,
}

#[derive(Default)]
struct BrokerCore {
    state: Mutex<CoreState>,
    fail_connects: AtomicU32,
    fail_declares: AtomicU32,
    nack_publishes: AtomicU32,
    withhold_confirms: AtomicBool,
    connects: AtomicU32,
    next_connection: AtomicU64,
}

impl BrokerCore {
    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn enqueue(&self, queue: &str, message: QueuedMessage) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        pump(&mut state, queue);
    }

    fn drop_connection(&self, connection_id: u64) {
        let mut state = self.lock();
        if let Some(conn) = state.connections.remove(&connection_id) {
            conn.closed.send_replace(true);
        }
        let CoreState {
            queues, unacked, ..
        } = &mut *state;
        for queue in queues.values_mut() {
            queue.consumers.retain(|c| c.connection_id != connection_id);
            queue.cursor = 0;
        }
        let orphaned: Vec<_> = unacked
            .keys()
            .filter(|(conn, _, _)| *conn == connection_id)
            .copied()
            .collect();
        for key in orphaned {
            if let Some(Unacked { queue, mut message }) = unacked.remove(&key) {
                message.delivery_count += 1;
                queues.entry(queue).or_default().ready.push_front(message);
            }
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            pump(&mut state, &name);
        }
    }

    fn settle(
        &self,
        key: (u64, u16, u64),
        requeue: Option<bool>,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(Unacked { queue, mut message }) = state.unacked.remove(&key) else {
            return Err(BrokerError::Channel(format!(
                "unknown delivery tag {} on channel {}",
                key.2, key.1
            )));
        };
        let entry = state.queues.entry(queue.clone()).or_default();
        if let Some(slot) = entry
            .consumers
            .iter_mut()
            .find(|c| c.connection_id == key.0 && c.channel_id == key.1)
        {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }
        if requeue == Some(true) {
            message.delivery_count += 1;
            entry.ready.push_front(message);
        }
        pump(&mut state, &queue);
        Ok(())
    }
}

/// Hand ready messages to consumers with free prefetch capacity, round-robin.
fn pump(state: &mut CoreState, queue_name: &str) {
    let CoreState {
        queues, unacked, ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };
    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let n = queue.consumers.len();
        let chosen = (0..n)
            .map(|i| (queue.cursor + i) % n)
            .find(|&idx| queue.consumers[idx].outstanding < queue.consumers[idx].prefetch);
        let Some(idx) = chosen else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        queue.cursor = (idx + 1) % n;

        let slot = &mut queue.consumers[idx];
        let tag = slot.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag: tag,
            route: queue_name.to_string(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            delivery_count: message.delivery_count,
        };
        match slot.tx.try_send(delivery) {
            Ok(()) => {
                slot.outstanding += 1;
                unacked.insert(
                    (slot.connection_id, slot.channel_id, tag),
                    Unacked {
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
            Err(_) => {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                queue.cursor = 0;
            }
        }
    }
}

/// In-process broker. Cloning shares the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a message on a queue as if an external producer had published it.
    pub fn inject(&self, queue: &str, body: Vec<u8>) {
        self.core.enqueue(
            queue,
            QueuedMessage {
                body,
                headers: Headers::new(),
                delivery_count: 0,
            },
        );
    }

    /// Remove and return every ready message on a queue.
    pub fn take_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut state = self.core.lock();
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.core.lock().unacked.len()
    }

    /// Drop every open connection, requeueing their unacked deliveries.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.core.lock().connections.keys().copied().collect();
        for id in ids {
            self.core.drop_connection(id);
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` queue declarations with a channel error.
    pub fn fail_next_declares(&self, n: u32) {
        self.core.fail_declares.store(n, Ordering::SeqCst);
    }

    /// Nack (and discard) the next `n` publishes.
    pub fn nack_next_publishes(&self, n: u32) {
        self.core.nack_publishes.store(n, Ordering::SeqCst);
    }

    /// Stop answering publishes in confirm mode.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.core.withhold_confirms.store(withhold, Ordering::SeqCst);
    }

    /// Number of successful connections made so far.
    pub fn connect_count(&self) -> u32 {
        self.core.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.core.lock().connections.len()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if BrokerCore::take_one(&self.core.fail_connects) {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        let id = self.core.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(ConnectionShared {
            id,
            closed,
            next_channel: AtomicU16::new(0),
        });
        self.core.lock().connections.insert(id, shared.clone());
        self.core.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            core: self.core.clone(),
            shared,
        }))
    }
}

struct MemoryConnection {
    core: Arc<BrokerCore>,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::ConnectionLost(self.shared.id));
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemoryChannel {
            core: self.core.clone(),
            conn: self.shared.clone(),
            id,
            next_publish_tag: 0,
            delivery_tags: Arc::new(AtomicU64::new(0)),
            confirm_tx: None,
        }))
    }

    async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.core.drop_connection(self.shared.id);
        Ok(())
    }
}

struct MemoryChannel {
    core: Arc<BrokerCore>,
    conn: Arc<ConnectionShared>,
    id: u16,
    next_publish_tag: u64,
    delivery_tags: Arc<AtomicU64>,
    confirm_tx: Option<mpsc::UnboundedSender<Confirm>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.conn.is_closed() {
            Err(BrokerError::ConnectionLost(self.conn.id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn channel_id(&self) -> u16 {
        self.id
    }

    async fn enable_confirms(&mut self) -> Result<mpsc::UnboundedReceiver<Confirm>, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.confirm_tx = Some(tx);
        Ok(rx)
    }

    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if BrokerCore::take_one(&self.core.fail_declares) {
            return Err(BrokerError::Channel(format!("declare of {queue} refused")));
        }
        self.core
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&mut self, message: OutboundMessage) -> Result<u64, BrokerError> {
        self.ensure_open()?;
        self.next_publish_tag += 1;
        let tag = self.next_publish_tag;
        let nacked = BrokerCore::take_one(&self.core.nack_publishes);
        if !nacked {
            self.core.enqueue(
                &message.route,
                QueuedMessage {
                    body: message.body,
                    headers: message.headers,
                    delivery_count: 0,
                },
            );
        }
        if let Some(tx) = &self.confirm_tx {
            if !self.core.withhold_confirms.load(Ordering::SeqCst) {
                let _ = tx.send(Confirm {
                    delivery_tag: tag,
                    ack: !nacked,
                });
            }
        }
        Ok(tag)
    }

    async fn consume(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        self.ensure_open()?;
        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        let mut state = self.core.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .consumers
            .push(ConsumerSlot {
                connection_id: self.conn.id,
                channel_id: self.id,
                prefetch,
                outstanding: 0,
                next_tag: self.delivery_tags.clone(),
                tx,
            });
        pump(&mut state, queue);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .settle((self.conn.id, self.id, delivery_tag), None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .settle((self.conn.id, self.id, delivery_tag), Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut publisher = conn.open_channel().await.unwrap();
        let mut consumer = conn.open_channel().await.unwrap();

        publisher
            .publish(OutboundMessage::new("jobs", b"one".to_vec()))
            .await
            .unwrap();
        let mut rx = consumer.consume("jobs", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, b"one");
        assert_eq!(delivery.delivery_count, 0);
        assert_eq!(broker.unacked_count(), 1);

        consumer.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("jobs"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_bumps_delivery_count() {
        let broker = InMemoryBroker::new();
        broker.inject("jobs", b"x".to_vec());
        let conn = broker.connect().await.unwrap();
        let mut consumer = conn.open_channel().await.unwrap();
        let mut rx = consumer.consume("jobs", 1).await.unwrap();

        let first = rx.recv().await.unwrap();
        consumer.nack(first.delivery_tag, true).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.delivery_count, 1);
        assert_ne!(second.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_outstanding() {
        let broker = InMemoryBroker::new();
        for i in 0..3u8 {
            broker.inject("jobs", vec![i]);
        }
        let conn = broker.connect().await.unwrap();
        let mut consumer = conn.open_channel().await.unwrap();
        let mut rx = consumer.consume("jobs", 2).await.unwrap();

        let a = rx.recv().await.unwrap();
        let _b = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.queue_depth("jobs"), 1);

        consumer.ack(a.delivery_tag).await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(c.body, vec![2]);
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_and_closes() {
        let broker = InMemoryBroker::new();
        broker.inject("jobs", b"x".to_vec());
        let conn = broker.connect().await.unwrap();
        let mut consumer = conn.open_channel().await.unwrap();
        let mut rx = consumer.consume("jobs", 1).await.unwrap();
        let _ = rx.recv().await.unwrap();

        broker.sever_connections();
        conn.closed().await;
        assert_eq!(broker.unacked_count(), 0);
        let requeued = broker.take_messages("jobs");
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].delivery_count, 1);
        assert!(matches!(
            consumer.ack(1).await,
            Err(BrokerError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        let conn = broker.connect().await.unwrap();
        assert_eq!(broker.connect_count(), 1);

        let mut channel = conn.open_channel().await.unwrap();
        let mut confirms = channel.enable_confirms().await.unwrap();
        broker.nack_next_publishes(1);
        let tag = channel
            .publish(OutboundMessage::new("jobs", vec![]))
            .await
            .unwrap();
        assert_eq!(
            confirms.recv().await.unwrap(),
            Confirm {
                delivery_tag: tag,
                ack: false
            }
        );
        assert_eq!(broker.queue_depth("jobs"), 0);
    }
}
