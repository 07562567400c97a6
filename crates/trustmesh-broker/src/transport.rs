use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Message headers. String-valued to keep adapters simple.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the reason a message was dead-lettered.
pub const HEADER_ERROR: &str = "x-error";
/// Header carrying the route a dead-lettered message was consumed from.
pub const HEADER_ORIGINAL_ROUTE: &str = "x-original-route";
/// Header carrying how many times a message had been delivered.
pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";

/// A message about to be published. Routes map one-to-one onto queues.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub route: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(route: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            route: route.into(),
            body,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub route: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    /// Number of earlier deliveries of this message (0 on first delivery).
    pub delivery_count: u32,
}

/// The broker's answer to a publish in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Opens physical connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One physical connection multiplexing many channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// Resolves once the connection has been lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One logical channel on a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn channel_id(&self) -> u16;

    /// Switch to publisher-confirm mode. Confirms arrive on the returned
    /// receiver, which closes when the channel goes away.
    async fn enable_confirms(&mut self) -> Result<mpsc::UnboundedReceiver<Confirm>, BrokerError>;

    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a message and return its delivery tag (1-based, per channel).
    async fn publish(&mut self, message: OutboundMessage) -> Result<u64, BrokerError>;

    /// Start consuming with manual acknowledgment.
    async fn consume(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
