//! Transport abstraction: connections, channels and deliveries.
//!
//! A [`Transport`] opens [`Connection`]s; a connection opens [`Channel`]s;
//! all declaration, publishing and consuming happens on a channel. The
//! [`MessageBroker`](crate::MessageBroker) pools both levels and never talks
//! to a concrete backend directly.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{ExchangeName, QueueName, RoutingKey};
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Every bound queue receives every message.
    Fanout,
    /// Dot-separated pattern match with `*` and `#` wildcards.
    Topic,
}

/// Whether the bus must write a message to disk before accepting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only; lost if the bus restarts.
    Transient,
    /// Written to disk; survives a bus restart on a durable queue.
    Persistent,
}

/// Entry point to a concrete bus backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection. Called lazily by the connection pool.
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live connection to the bus.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// `false` once the connection has been closed by either side; the pool
    /// then discards it instead of reusing it.
    fn is_open(&self) -> bool;
}

/// A lightweight session on a connection. Declarations, publishing and
/// consuming all go through a channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Idempotent; fails if `name` exists with a different kind or durability.
    async fn declare_exchange(
        &self,
        name: &ExchangeName,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Idempotent; fails if `name` exists with a different durability.
    async fn declare_queue(&self, name: &QueueName, durable: bool) -> Result<(), BrokerError>;

    /// Routes messages published to `exchange` under keys matching
    /// `routing_key` into `queue`. Both must exist; repeating a binding is a
    /// no-op.
    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
    ) -> Result<(), BrokerError>;

    /// Publishes to an existing exchange. Fails with
    /// [`BrokerError::ExchangeNotFound`] if it was never declared. A message
    /// matching no binding is dropped.
    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError>;

    /// Maximum number of unsettled deliveries for consumers on this channel.
    /// Zero means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Starts consuming `queue`. Deliveries arrive on the returned
    /// [`Consumer`], limited by the channel's prefetch count.
    async fn consume(&self, queue: &QueueName) -> Result<Consumer, BrokerError>;

    /// `false` once the channel or its connection has closed.
    fn is_open(&self) -> bool;
}

/// Settles a single delivery on the bus.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Removes the message from its queue.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Returns the message to its queue when `requeue` is set; drops it
    /// otherwise.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer. Must be settled exactly once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one queue subscription.
#[derive(Debug)]
pub struct Consumer {
    receiver: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Next delivery, or `None` once the channel has been closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}
