//! Port traits: the capabilities the core consumes.
//!
//! Infrastructure crates implement these; the control loop, the builder and
//! the status poller only ever see `Arc<dyn Trait>`.

use async_trait::async_trait;

use crate::errors::{InfrastructureError, StageError};
use crate::status::{TaskCreate, TaskStatusRecord, TaskUpdate};
use crate::types::{ChunkNode, EntityNode};
use crate::{ExchangeName, ResourceLocator, RoutingKey, TaskId};

/// What a stage hands back to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Bytes to store under the stage's `{bucket}/{task_id}_{object}`.
    pub payload: Vec<u8>,
    /// Where the next stage will find `payload`.
    pub locator: ResourceLocator,
}

/// Stage-specific transformation. One instance per configured stage.
///
/// Handlers read their input through the locator (and the blob store they
/// were built with) and return their output; they never publish or touch
/// task status.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        task_id: &TaskId,
        locator: &ResourceLocator,
    ) -> Result<StageOutput, StageError>;
}

/// Byte payload storage addressed by bucket and object name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `None` when the object does not exist.
    async fn get(&self, bucket: &str, object: &str) -> Result<Option<Vec<u8>>, InfrastructureError>;

    /// Stores `data`, overwriting any existing object with the same key.
    async fn put(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<(), InfrastructureError>;
}

/// Durable task status records.
#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    async fn create(&self, task: TaskCreate) -> Result<(), InfrastructureError>;

    /// Applies only the fields set on `update`.
    ///
    /// Fails with [`InfrastructureError::TaskNotFound`] if no record exists.
    async fn update(&self, update: TaskUpdate) -> Result<(), InfrastructureError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>, InfrastructureError>;
}

/// Durable publish onto a topic exchange.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
    ) -> Result<(), InfrastructureError>;
}

/// Outcome of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Drop the message without requeueing it.
    Reject,
}

/// Callback invoked by a subscription for every delivered message.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, body: &[u8]) -> Disposition;
}

/// Knowledge-graph writes used by the builder.
///
/// Each method runs as its own write transaction and is idempotent: nodes and
/// relationships are merged, not duplicated. The returned count is the number
/// of items the store reports as merged.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn ensure_indexes(&self) -> Result<(), InfrastructureError>;

    async fn upsert_chunks(&self, chunks: &[ChunkNode]) -> Result<u64, InfrastructureError>;

    async fn upsert_entities(&self, entities: &[EntityNode]) -> Result<u64, InfrastructureError>;

    /// Links each entity to the chunk named by its `chunk_id`.
    async fn link_entities(&self, entities: &[EntityNode]) -> Result<u64, InfrastructureError>;
}
