//! Pooled message broker: binding, durable publish and subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Pool, RecycleError, RecycleResult};
use pipeline::{
    DeliveryHandler, Disposition, ExchangeName, InfrastructureError, MessagePublisher, QueueName,
    RoutingKey,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::transport::{Channel, Connection, DeliveryMode, ExchangeKind, Transport};

/// A worker processes one message at a time.
pub const PREFETCH_COUNT: u16 = 1;

/// Pool sizes for a [`MessageBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub max_channels: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 2,
            max_channels: 10,
        }
    }
}

/// Pool of bus connections.
pub type ConnectionPool = Pool<ConnectionManager>;

/// Pool of channels, each opened on a connection from a [`ConnectionPool`].
pub type ChannelPool = Pool<ChannelManager>;

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
}

impl managed::Manager for ConnectionManager {
    type Type = Arc<dyn Connection>;
    type Error = BrokerError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        debug!("Opening bus connection");
        self.transport.connect().await
    }

    async fn recycle(&self, connection: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        if connection.is_open() {
            Ok(())
        } else {
            Err(RecycleError::Message("bus connection closed".into()))
        }
    }
}

/// Opens each channel on a connection borrowed from the connection pool.
pub struct ChannelManager {
    connections: ConnectionPool,
}

impl managed::Manager for ChannelManager {
    type Type = Arc<dyn Channel>;
    type Error = BrokerError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let connection = self.connections.get().await?;
        debug!("Opening bus channel");
        connection.open_channel().await
    }

    async fn recycle(&self, channel: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        if channel.is_open() {
            Ok(())
        } else {
            Err(RecycleError::Message("bus channel closed".into()))
        }
    }
}

/// Counters reported when a subscription ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub acked: u64,
    pub rejected: u64,
}

/// Entry point to the message bus.
///
/// Cheap to clone; clones share both pools.
#[derive(Clone)]
pub struct MessageBroker {
    connections: ConnectionPool,
    channels: ChannelPool,
}

impl MessageBroker {
    /// Builds both pools. Nothing is opened until the first operation.
    pub fn new(transport: Arc<dyn Transport>, settings: BrokerSettings) -> Result<Self, BrokerError> {
        let connections = Pool::builder(ConnectionManager { transport })
            .max_size(settings.max_connections.max(1))
            .build()
            .map_err(|e| BrokerError::Pool(e.to_string()))?;
        let channels = Pool::builder(ChannelManager {
            connections: connections.clone(),
        })
        .max_size(settings.max_channels.max(1))
        .build()
        .map_err(|e| BrokerError::Pool(e.to_string()))?;
        Ok(Self {
            connections,
            channels,
        })
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn channel_pool(&self) -> &ChannelPool {
        &self.channels
    }

    /// Declares a durable topic exchange and a durable queue, then binds the
    /// queue under `routing_key`. Safe to repeat.
    pub async fn bind(
        &self,
        exchange: &ExchangeName,
        queue: &QueueName,
        routing_key: &RoutingKey,
    ) -> Result<(), BrokerError> {
        let channel = self.channels.get().await?;
        channel
            .declare_exchange(exchange, ExchangeKind::Topic, true)
            .await?;
        channel.declare_queue(queue, true).await?;
        channel.bind_queue(queue, exchange, routing_key).await?;
        info!(
            exchange = %exchange,
            queue = %queue,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    /// Declares a durable queue without binding it.
    pub async fn declare_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        let channel = self.channels.get().await?;
        channel.declare_queue(queue, true).await
    }

    /// Publishes `body` to an existing exchange. `durable` selects persistent
    /// delivery.
    pub async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mode = if durable {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        };
        let channel = self.channels.get().await?;
        channel.publish(exchange, routing_key, body, mode).await?;
        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    /// Consumes `queue` one message at a time until `shutdown` turns `true`
    /// (or its sender is dropped) or the bus closes the consumer.
    ///
    /// Each delivery is passed to `handler` on its own task. `Ack` acknowledges
    /// the message; `Reject` or a panicking handler rejects it without requeue.
    pub async fn subscribe(
        &self,
        queue: &QueueName,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SubscriptionStats, BrokerError> {
        let channel = self.channels.get().await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        let mut consumer = channel.consume(queue).await?;
        info!(queue = %queue, prefetch = PREFETCH_COUNT, "Subscribed to queue");

        let mut stats = SubscriptionStats::default();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut delivery = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = consumer.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        warn!(queue = %queue, "Consumer closed by the bus");
                        break;
                    }
                },
            };

            let tag = delivery.delivery_tag;
            let body = std::mem::take(&mut delivery.body);
            let task_handler = Arc::clone(&handler);
            let disposition =
                match tokio::spawn(async move { task_handler.on_delivery(&body).await }).await {
                    Ok(disposition) => disposition,
                    Err(join_error) => {
                        error!(
                            queue = %queue,
                            delivery_tag = tag,
                            error = %join_error,
                            "Delivery handler did not complete"
                        );
                        Disposition::Reject
                    }
                };

            let settled = match disposition {
                Disposition::Ack => {
                    stats.acked += 1;
                    delivery.ack().await
                }
                Disposition::Reject => {
                    stats.rejected += 1;
                    delivery.reject(false).await
                }
            };
            if let Err(e) = settled {
                error!(queue = %queue, delivery_tag = tag, error = %e, "Failed to settle delivery");
            }
        }

        info!(
            queue = %queue,
            acked = stats.acked,
            rejected = stats.rejected,
            "Subscription stopped"
        );
        Ok(stats)
    }
}

#[async_trait]
impl MessagePublisher for MessageBroker {
    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
    ) -> Result<(), InfrastructureError> {
        MessageBroker::publish(self, exchange, routing_key, body, true)
            .await
            .map_err(InfrastructureError::from)
    }
}
