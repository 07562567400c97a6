use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use trustmesh_types::{BackoffPolicy, ErrorClass, TaskId, TrustmeshError};

use crate::error::BrokerError;
use crate::lease::{ChannelLease, ConfirmOutcome};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Delivery, HEADER_DELIVERY_COUNT,
    HEADER_ERROR, HEADER_ORIGINAL_ROUTE, Headers, OutboundMessage,
};

/// Configuration for the channel manager.
#[derive(Debug, Clone)]
pub struct ChannelManagerConfig {
    /// Channels kept open for publishing, used round-robin.
    pub publish_channels: usize,
    /// Upper bound on publish plus consumer channels.
    pub max_channels: usize,
    pub confirm_mode: bool,
    /// How long a publish waits for the broker's confirm.
    pub confirm_timeout: Duration,
    pub reconnect: BackoffPolicy,
    /// Deliveries seen this many times before are dead-lettered instead of requeued.
    pub max_redeliveries: u32,
    pub dead_letter_route: String,
    pub prefetch: u16,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            publish_channels: 2,
            max_channels: 16,
            confirm_mode: true,
            confirm_timeout: Duration::from_secs(5),
            reconnect: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(30)),
            max_redeliveries: 5,
            dead_letter_route: "dead-letter".into(),
            prefetch: 16,
        }
    }
}

/// Lifecycle of the managed broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but a channel failed and is being replaced.
    Degraded,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Per-call publish settings.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Task the message belongs to, tracked alongside the pending confirm.
    pub task_id: Option<TaskId>,
    pub headers: Headers,
    /// Bound on waiting for a usable connection.
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            headers: Headers::new(),
            timeout: Duration::from_secs(5),
            cancel: None,
        }
    }
}

impl PublishOptions {
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub delivery_tag: u64,
    /// False when the manager runs without publisher confirms.
    pub confirmed: bool,
}

/// Why a consumer handler rejected a delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<TrustmeshError> for HandlerError {
    fn from(err: TrustmeshError) -> Self {
        match err.class() {
            ErrorClass::Permanent => HandlerError::Permanent(err.to_string()),
            _ => HandlerError::Transient(err.to_string()),
        }
    }
}

/// Processes deliveries from a consumed queue. A delivery is acked only after
/// `handle` returns `Ok`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

struct ConsumerRegistration {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
}

struct ActiveConnection {
    id: u64,
    conn: Arc<dyn BrokerConnection>,
    /// Cancelled when this connection is lost; stops its confirm pumps and consumers.
    token: CancellationToken,
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelManagerStats {
    pub state: ConnectionState,
    pub published: u64,
    pub confirmed: u64,
    pub nacked: u64,
    pub unconfirmed: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
    pub leases_in_use: usize,
    pub lease_capacity: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    confirmed: AtomicU64,
    nacked: AtomicU64,
    unconfirmed: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    reconnects: AtomicU64,
}

/// Owns the broker connection and every channel on it.
///
/// A supervisor task keeps the connection alive, reconnecting with backoff.
/// Publishers and consumers never touch the connection directly: publishers
/// wait on the state channel for a usable connection, and registered
/// consumers are re-attached after every reconnect.
pub struct ChannelManager {
    transport: Arc<dyn BrokerTransport>,
    config: ChannelManagerConfig,
    connection: RwLock<Option<ActiveConnection>>,
    publishers: RwLock<Vec<Arc<Mutex<ChannelLease>>>>,
    next_publisher: AtomicUsize,
    next_connection_id: AtomicU64,
    next_consumer_id: AtomicU64,
    consumers: DashMap<ConsumerId, ConsumerRegistration>,
    declared: DashSet<String>,
    leases_in_use: AtomicUsize,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ChannelManagerConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let publish_channels = config.publish_channels.max(1);
        Self {
            transport,
            config: ChannelManagerConfig {
                publish_channels,
                max_channels: config.max_channels.max(publish_channels),
                ..config
            },
            connection: RwLock::new(None),
            publishers: RwLock::new(Vec::new()),
            next_publisher: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(0),
            next_consumer_id: AtomicU64::new(0),
            consumers: DashMap::new(),
            declared: DashSet::new(),
            leases_in_use: AtomicUsize::new(publish_channels),
            state_tx,
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ChannelManagerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Spawn the supervisor task that connects and reconnects.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise().await })
    }

    /// Close the connection and stop the supervisor. Pending publishes resolve
    /// as unconfirmed.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.teardown_connection().await;
        self.state_tx.send_replace(ConnectionState::Closed);
        tracing::info!("Channel manager closed");
    }

    /// Wait until the connection is usable, bounded by `timeout`.
    pub async fn wait_connected(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::select! {
            res = tokio::time::timeout(
                timeout,
                rx.wait_for(|s| s.is_usable() || *s == ConnectionState::Closed),
            ) => res.map(|r| r.map(|state| *state)),
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        };
        match waited {
            Ok(Ok(ConnectionState::Closed)) | Ok(Err(_)) => Err(BrokerError::Closed),
            Ok(Ok(_)) => Ok(()),
            Err(_) => Err(BrokerError::Unavailable(format!(
                "no connection within {} ms (state {:?})",
                timeout.as_millis(),
                self.state()
            ))),
        }
    }

    /// Declare a queue now (if connected) and again after every reconnect.
    pub async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.declared.insert(queue.to_string());
        let Some((_, lease)) = self.pick_publisher().await else {
            return Ok(());
        };
        let mut guard = lease.lock().await;
        guard.channel_mut().declare_queue(queue).await
    }

    /// Publish a message and, in confirm mode, wait for the broker's answer.
    ///
    /// A confirm timeout or cancellation removes the pending-confirm entry; a
    /// dropped connection resolves as `Unconfirmed`. Either way the caller
    /// decides whether to republish.
    pub async fn publish(
        &self,
        route: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt, BrokerError> {
        let cancel = options.cancel.clone().unwrap_or_default();
        self.wait_connected(options.timeout, &cancel).await?;

        let Some((index, lease)) = self.pick_publisher().await else {
            return Err(BrokerError::Unavailable("no publish channel open".into()));
        };
        let mut message = OutboundMessage::new(route, body);
        message.headers.extend(options.headers);

        let published = lease.lock().await.publish(message, options.task_id).await;
        let (delivery_tag, confirm) = match published {
            Ok(v) => v,
            Err(e) => {
                self.on_channel_error(index, &e).await;
                return Err(e);
            }
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let Some(confirm) = confirm else {
            return Ok(PublishReceipt {
                delivery_tag,
                confirmed: false,
            });
        };

        let outcome = tokio::select! {
            outcome = confirm => outcome.unwrap_or(ConfirmOutcome::Unconfirmed),
            _ = tokio::time::sleep(self.config.confirm_timeout) => {
                lease.lock().await.forget(delivery_tag);
                self.counters.unconfirmed.fetch_add(1, Ordering::Relaxed);
                return Err(BrokerError::ConfirmTimeout {
                    delivery_tag,
                    timeout_ms: self.config.confirm_timeout.as_millis() as u64,
                });
            }
            _ = cancel.cancelled() => {
                lease.lock().await.forget(delivery_tag);
                return Err(BrokerError::Cancelled);
            }
        };

        match outcome {
            ConfirmOutcome::Ack => {
                self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
                Ok(PublishReceipt {
                    delivery_tag,
                    confirmed: true,
                })
            }
            ConfirmOutcome::Nack => {
                self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(route, delivery_tag, "Publish nacked by broker");
                Err(BrokerError::Nacked { delivery_tag })
            }
            ConfirmOutcome::Unconfirmed => {
                self.counters.unconfirmed.fetch_add(1, Ordering::Relaxed);
                Err(BrokerError::Unconfirmed { delivery_tag })
            }
        }
    }

    /// Register a consumer. It is attached immediately when connected and
    /// re-attached after every reconnect until cancelled.
    pub async fn consume(
        self: &Arc<Self>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerId, BrokerError> {
        let capacity = self.config.max_channels;
        self.leases_in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|in_use| BrokerError::LeaseExhausted { in_use, capacity })?;

        let id = ConsumerId(self.next_consumer_id.fetch_add(1, Ordering::SeqCst) + 1);
        let token = self.shutdown.child_token();
        self.consumers.insert(
            id,
            ConsumerRegistration {
                queue: queue.to_string(),
                handler: handler.clone(),
                token: token.clone(),
            },
        );

        let active = self
            .connection
            .read()
            .await
            .as_ref()
            .map(|a| (a.conn.clone(), a.token.clone()));
        if let Some((conn, conn_token)) = active {
            if let Err(e) = self
                .attach_consumer(&conn, queue, handler, token, conn_token)
                .await
            {
                tracing::warn!(queue, error = %e, "Consumer not attached, will retry after reconnect");
            }
        }
        Ok(id)
    }

    /// Stop a consumer and release its lease.
    pub fn cancel_consumer(&self, id: ConsumerId) -> bool {
        match self.consumers.remove(&id) {
            Some((_, registration)) => {
                registration.token.cancel();
                self.leases_in_use.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Publishes still waiting for a broker confirm.
    pub async fn pending_confirms(&self) -> usize {
        let leases = self.publishers.read().await.clone();
        let mut total = 0;
        for lease in leases {
            total += lease.lock().await.pending_count();
        }
        total
    }

    pub fn stats(&self) -> ChannelManagerStats {
        let c = &self.counters;
        ChannelManagerStats {
            state: self.state(),
            published: c.published.load(Ordering::Relaxed),
            confirmed: c.confirmed.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            unconfirmed: c.unconfirmed.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            leases_in_use: self.leases_in_use.load(Ordering::SeqCst),
            lease_capacity: self.config.max_channels,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Closed {
                return false;
            }
            tracing::info!(from = ?state, to = ?next, "Broker connection state changed");
            *state = next;
            true
        });
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(if connected_before {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.establish().await {
                Ok(conn) => {
                    if connected_before {
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    connected_before = true;
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = conn.closed() => {
                            tracing::warn!("Broker connection lost");
                            self.teardown_connection().await;
                        }
                    }
                }
                Err(e) => {
                    let delay = self.config.reconnect.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connect failed, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.teardown_connection().await;
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    async fn establish(self: &Arc<Self>) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let conn = self.transport.connect().await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();

        let leases = match self.prepare_publishers(id, conn.as_ref(), &token).await {
            Ok(leases) => leases,
            Err(e) => {
                // Stops any confirm pumps already spawned for this connection.
                token.cancel();
                let _ = conn.close().await;
                return Err(e);
            }
        };

        *self.publishers.write().await = leases;
        *self.connection.write().await = Some(ActiveConnection {
            id,
            conn: conn.clone(),
            token: token.clone(),
        });

        let registrations: Vec<_> = self
            .consumers
            .iter()
            .map(|r| (r.queue.clone(), r.handler.clone(), r.token.clone()))
            .collect();
        for (queue, handler, consumer_token) in registrations {
            if let Err(e) = self
                .attach_consumer(&conn, &queue, handler, consumer_token, token.clone())
                .await
            {
                tracing::warn!(queue, error = %e, "Failed to re-attach consumer");
            }
        }

        tracing::info!(connection_id = id, "Broker connection established");
        Ok(conn)
    }

    /// Open the publish leases and redeclare every known queue on the first.
    async fn prepare_publishers(
        &self,
        connection_id: u64,
        conn: &dyn BrokerConnection,
        token: &CancellationToken,
    ) -> Result<Vec<Arc<Mutex<ChannelLease>>>, BrokerError> {
        let mut leases = Vec::with_capacity(self.config.publish_channels);
        for _ in 0..self.config.publish_channels {
            leases.push(self.open_publisher(connection_id, conn, token).await?);
        }

        let declared: Vec<String> = self.declared.iter().map(|q| q.key().clone()).collect();
        if let Some(first) = leases.first() {
            let mut guard = first.lock().await;
            for queue in &declared {
                guard.channel_mut().declare_queue(queue).await?;
            }
        }
        Ok(leases)
    }

    async fn open_publisher(
        &self,
        connection_id: u64,
        conn: &dyn BrokerConnection,
        token: &CancellationToken,
    ) -> Result<Arc<Mutex<ChannelLease>>, BrokerError> {
        let mut channel = conn.open_channel().await?;
        let confirms = if self.config.confirm_mode {
            Some(channel.enable_confirms().await?)
        } else {
            None
        };
        let lease = Arc::new(Mutex::new(ChannelLease::new(
            connection_id,
            channel,
            self.config.confirm_mode,
        )));
        if let Some(rx) = confirms {
            tokio::spawn(pump_confirms(lease.clone(), rx, token.clone()));
        }
        Ok(lease)
    }

    async fn attach_consumer(
        self: &Arc<Self>,
        conn: &Arc<dyn BrokerConnection>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        consumer_token: CancellationToken,
        conn_token: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut channel = conn.open_channel().await?;
        channel.declare_queue(queue).await?;
        let rx = channel.consume(queue, self.config.prefetch).await?;
        tracing::debug!(queue, channel_id = channel.channel_id(), "Consumer attached");

        let manager = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            manager
                .run_consumer(queue, handler, channel, rx, consumer_token, conn_token)
                .await
        });
        Ok(())
    }

    async fn run_consumer(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn DeliveryHandler>,
        channel: Box<dyn BrokerChannel>,
        mut rx: mpsc::Receiver<Delivery>,
        consumer_token: CancellationToken,
        conn_token: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = consumer_token.cancelled() => break,
                _ = conn_token.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(d) => d,
                    None => break,
                },
            };
            self.settle(&queue, handler.as_ref(), channel.as_ref(), delivery)
                .await;
        }
        tracing::debug!(queue, "Consumer stopped");
    }

    async fn settle(
        &self,
        queue: &str,
        handler: &dyn DeliveryHandler,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) {
        let tag = delivery.delivery_tag;
        let settled = match handler.handle(&delivery).await {
            Ok(()) => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                channel.ack(tag).await
            }
            Err(HandlerError::Permanent(reason)) => {
                self.dead_letter(queue, channel, &delivery, &reason).await
            }
            Err(HandlerError::Transient(reason))
                if delivery.delivery_count >= self.config.max_redeliveries =>
            {
                let reason = format!(
                    "redelivery limit {} reached: {reason}",
                    self.config.max_redeliveries
                );
                self.dead_letter(queue, channel, &delivery, &reason).await
            }
            Err(HandlerError::Transient(reason)) => {
                tracing::debug!(queue, tag, reason, "Handler failed, requeueing delivery");
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                channel.nack(tag, true).await
            }
        };
        if let Err(e) = settled {
            // The broker redelivers anything left unsettled on a lost channel.
            tracing::warn!(queue, tag, error = %e, "Failed to settle delivery");
        }
    }

    async fn dead_letter(
        &self,
        queue: &str,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut options = PublishOptions::default()
            .with_timeout(self.config.confirm_timeout)
            .with_header(HEADER_ERROR, reason)
            .with_header(HEADER_ORIGINAL_ROUTE, queue)
            .with_header(HEADER_DELIVERY_COUNT, delivery.delivery_count.to_string());
        for (k, v) in &delivery.headers {
            options.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }

        match self
            .publish(&self.config.dead_letter_route, delivery.body.clone(), options)
            .await
        {
            Ok(_) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::error!(queue, reason, "Delivery dead-lettered");
                channel.ack(delivery.delivery_tag).await
            }
            Err(e) => {
                tracing::warn!(queue, error = %e, "Dead-letter publish failed, requeueing");
                channel.nack(delivery.delivery_tag, true).await
            }
        }
    }

    async fn pick_publisher(&self) -> Option<(usize, Arc<Mutex<ChannelLease>>)> {
        let publishers = self.publishers.read().await;
        if publishers.is_empty() {
            return None;
        }
        let index = self.next_publisher.fetch_add(1, Ordering::Relaxed) % publishers.len();
        Some((index, publishers[index].clone()))
    }

    /// Replace a publish lease whose channel failed while the connection stays up.
    async fn on_channel_error(&self, index: usize, err: &BrokerError) {
        if !matches!(err, BrokerError::Channel(_)) {
            return;
        }
        self.set_state(ConnectionState::Degraded);
        tracing::warn!(error = %err, index, "Publish channel failed, replacing lease");

        let active = self
            .connection
            .read()
            .await
            .as_ref()
            .map(|a| (a.id, a.conn.clone(), a.token.clone()));
        let Some((id, conn, token)) = active else {
            return;
        };
        match self.open_publisher(id, conn.as_ref(), &token).await {
            Ok(fresh) => {
                let old = {
                    let mut publishers = self.publishers.write().await;
                    match publishers.get_mut(index) {
                        Some(slot) => Some(std::mem::replace(slot, fresh)),
                        None => None,
                    }
                };
                if let Some(old) = old {
                    old.lock().await.invalidate();
                }
                self.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Degraded {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "Could not replace publish lease"),
        }
    }

    /// Invalidate every lease on the current connection.
    async fn teardown_connection(&self) {
        let active = self.connection.write().await.take();
        if let Some(active) = active {
            active.token.cancel();
            let _ = active.conn.close().await;
        }
        let leases = std::mem::take(&mut *self.publishers.write().await);
        let mut dropped = 0;
        for lease in leases {
            dropped += lease.lock().await.invalidate().len();
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Pending publishes resolved as unconfirmed");
        }
    }
}

async fn pump_confirms(
    lease: Arc<Mutex<ChannelLease>>,
    mut rx: mpsc::UnboundedReceiver<crate::transport::Confirm>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            confirm = rx.recv() => match confirm {
                Some(confirm) => {
                    if !lease.lock().await.resolve(confirm) {
                        tracing::debug!(tag = confirm.delivery_tag, "Confirm for untracked delivery");
                    }
                }
                None => break,
            },
        }
    }
}
