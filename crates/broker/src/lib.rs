//! Message bus infrastructure for the indexing pipeline.
//!
//! [`MessageBroker`] owns two lazily populated `deadpool` pools (connections,
//! and channels opened on pooled connections) and exposes the three operations the
//! pipeline needs: [`bind`](MessageBroker::bind) a durable queue to a durable
//! topic exchange, [`publish`](MessageBroker::publish) a persistent message,
//! and [`subscribe`](MessageBroker::subscribe) a [`pipeline::DeliveryHandler`]
//! to a queue with a prefetch of one.
//!
//! The wire protocol sits behind [`Transport`]. [`MemoryTransport`] provides
//! the same semantics in-process.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** The [`pipeline`] crate sees only
//! [`pipeline::MessagePublisher`] and [`pipeline::DeliveryHandler`].

mod broker;
mod error;
mod memory;
mod topic;
mod transport;

pub use broker::{
    BrokerSettings, ChannelManager, ChannelPool, ConnectionManager, ConnectionPool, MessageBroker,
    SubscriptionStats, PREFETCH_COUNT,
};
pub use error::BrokerError;
pub use memory::{MemoryChannel, MemoryConnection, MemoryTransport, QueuedMessage};
pub use topic::topic_matches;
pub use transport::{
    Acker, Channel, Connection, Consumer, Delivery, DeliveryMode, ExchangeKind, Transport,
};
