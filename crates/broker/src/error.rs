//! Errors raised by the message bus layer.

use deadpool::managed::PoolError;
use pipeline::InfrastructureError;
use thiserror::Error;

/// Failure talking to the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The transport could not open or keep a connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A channel operation failed or the channel is closed.
    #[error("channel failed: {0}")]
    Channel(String),

    /// Publish or bind against an exchange that was never declared.
    #[error("exchange '{0}' does not exist")]
    ExchangeNotFound(String),

    /// Bind or consume against a queue that was never declared.
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    /// Re-declaration with properties that differ from the existing entity.
    #[error("'{name}' is already declared with different properties")]
    PreconditionFailed { name: String },

    /// A delivery was settled twice.
    #[error("delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    /// The connection or channel pool was closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The pool could not be built or could not hand out an object.
    #[error("pool error: {0}")]
    Pool(String),
}

impl From<PoolError<BrokerError>> for BrokerError {
    fn from(error: PoolError<BrokerError>) -> Self {
        match error {
            PoolError::Backend(e) => e,
            PoolError::Closed => BrokerError::PoolClosed,
            other => BrokerError::Pool(other.to_string()),
        }
    }
}

impl From<BrokerError> for InfrastructureError {
    fn from(error: BrokerError) -> Self {
        InfrastructureError::Bus(error.to_string())
    }
}
