//! Terminal stage: materialises a task's extracted graph into the graph store.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    BlobStore, DeliveryHandler, Disposition, FailureKind, GraphDocument, GraphStore,
    InfrastructureError, LocatorError, ResourceLocator, TaskEnvelope, TaskStatusStore, TaskUpdate,
};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

use crate::context::DEFAULT_BLOB_SCHEME;
use crate::processor::{decode_or_fail, mark_failed};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unsupported locator scheme '{found}', expected '{expected}'")]
    Scheme { found: String, expected: String },

    #[error("locator is not a blob address: {0}")]
    Locator(#[from] LocatorError),

    #[error("resource not found: {0}")]
    MissingObject(String),

    #[error("graph payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("expected {expected} {kind} to be written, the store reported {actual}")]
    CountMismatch {
        kind: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

/// Item counts of a completed build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub chunks: u64,
    pub entities: u64,
    pub relationships: u64,
}

fn verify(kind: &'static str, expected: usize, actual: u64) -> Result<(), BuildError> {
    let expected = expected as u64;
    if expected != actual {
        return Err(BuildError::CountMismatch {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Loads a [`GraphDocument`] from the blob store and writes it, step by
/// step, to a [`GraphStore`].
pub struct GraphBuilder {
    blobs: Arc<dyn BlobStore>,
    graph: Arc<dyn GraphStore>,
    blob_scheme: String,
}

impl GraphBuilder {
    pub fn new(blobs: Arc<dyn BlobStore>, graph: Arc<dyn GraphStore>) -> Self {
        Self {
            blobs,
            graph,
            blob_scheme: DEFAULT_BLOB_SCHEME.to_string(),
        }
    }

    pub fn with_blob_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.blob_scheme = scheme.into();
        self
    }

    async fn load(&self, locator: &ResourceLocator) -> Result<GraphDocument, BuildError> {
        if locator.scheme() != self.blob_scheme {
            return Err(BuildError::Scheme {
                found: locator.scheme().to_string(),
                expected: self.blob_scheme.clone(),
            });
        }
        let (bucket, object) = locator.bucket_object()?;
        let raw = self
            .blobs
            .get(bucket, object)
            .await?
            .ok_or_else(|| BuildError::MissingObject(locator.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Indexes, chunk nodes, entity nodes, then chunk→entity links. Node
    /// counts reported by the store must match the payload.
    pub async fn build(&self, locator: &ResourceLocator) -> Result<BuildReport, BuildError> {
        let document = self.load(locator).await?;

        self.graph.ensure_indexes().await?;

        let chunks = self.graph.upsert_chunks(&document.chunks).await?;
        verify("chunks", document.chunks.len(), chunks)?;
        info!(chunks, "Created chunks");

        let entities = self.graph.upsert_entities(&document.entities).await?;
        verify("entities", document.entities.len(), entities)?;
        info!(entities, "Created entities");

        let relationships = self.graph.link_entities(&document.entities).await?;
        info!(relationships, "Created relationships");

        Ok(BuildReport {
            chunks,
            entities,
            relationships,
        })
    }
}

/// Builder-side [`DeliveryHandler`] for the builder queue.
///
/// The only component that sets `COMPLETED`. A build failure leaves the
/// task's status untouched.
pub struct BuilderProcessor {
    builder: GraphBuilder,
    tasks: Arc<dyn TaskStatusStore>,
}

impl BuilderProcessor {
    pub fn new(builder: GraphBuilder, tasks: Arc<dyn TaskStatusStore>) -> Self {
        Self { builder, tasks }
    }

    pub async fn process(&self, envelope: &TaskEnvelope) -> Disposition {
        let Some(locator) = &envelope.resource_locator else {
            error!(failure_kind = %FailureKind::Validation, "Envelope has no resource locator; rejecting message");
            mark_failed(self.tasks.as_ref(), &envelope.task_id, &envelope.stage_name).await;
            return Disposition::Reject;
        };

        let report = match self.builder.build(locator).await {
            Ok(report) => report,
            Err(e) => {
                let kind = match e {
                    BuildError::Infrastructure(_) => FailureKind::Infrastructure,
                    _ => FailureKind::Handler,
                };
                error!(failure_kind = %kind, locator = %locator, error = %e, "Build failed; rejecting message");
                return Disposition::Reject;
            }
        };

        let update = TaskUpdate::completed(envelope.task_id.clone(), envelope.stage_name.clone());
        if let Err(e) = self.tasks.update(update).await {
            error!(
                failure_kind = %FailureKind::Infrastructure,
                error = %e,
                "Could not mark task as completed; rejecting message"
            );
            return Disposition::Reject;
        }
        info!(
            chunks = report.chunks,
            entities = report.entities,
            relationships = report.relationships,
            "Task completed"
        );
        Disposition::Ack
    }
}

#[async_trait]
impl DeliveryHandler for BuilderProcessor {
    async fn on_delivery(&self, body: &[u8]) -> Disposition {
        let Some(envelope) = decode_or_fail(body, self.tasks.as_ref()).await else {
            return Disposition::Reject;
        };
        let span = info_span!(
            "build",
            task_id = %envelope.task_id,
            stage = %envelope.stage_name
        );
        self.process(&envelope).instrument(span).await
    }
}
