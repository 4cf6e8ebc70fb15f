//! The per-delivery control loop for pipeline workers.
//!
//! Every delivery walks `Received → Validated → Handled → Persisted →
//! Published → Acked`; any failure along the way, a panicking handler
//! included, ends in a rejection and a best-effort `FAILED` status at the
//! envelope's stage. There is no retry inside the loop.
//!
//! The `IN_PROGRESS` update is written before the next envelope is published.
//! Once published, the envelope belongs to the next stage (or the builder),
//! which may update the same record at any time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use pipeline::{
    BlobStore, DeliveryHandler, Disposition, EnvelopeError, FailureKind, HandlerRegistry,
    MessagePublisher, PipelineDefinition, StageError, StageName, TaskEnvelope, TaskId,
    TaskStatusStore, TaskUpdate,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Furthest point a delivery reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Received,
    Validated,
    Handled,
    Persisted,
    Published,
    Acked,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("envelope has no resource locator")]
    MissingLocator,

    #[error("no handler registered for stage '{0}'")]
    NoHandler(StageName),

    #[error("stage '{0}' is not part of the pipeline definition")]
    UnknownStage(StageName),

    #[error("could not encode the next envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("handler for stage '{stage}' panicked: {message}")]
    Panicked { stage: StageName, message: String },

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl ProcessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingLocator | Self::NoHandler(_) | Self::UnknownStage(_) => {
                FailureKind::Validation
            }
            Self::Encode(_) => FailureKind::Infrastructure,
            Self::Panicked { .. } => FailureKind::Handler,
            Self::Stage(e) => e.kind(),
        }
    }
}

impl From<pipeline::InfrastructureError> for ProcessError {
    fn from(error: pipeline::InfrastructureError) -> Self {
        Self::Stage(StageError::Infrastructure(error))
    }
}

/// Worker-side [`DeliveryHandler`] for the backlog queue.
pub struct Processor {
    definition: Arc<PipelineDefinition>,
    registry: Arc<HandlerRegistry>,
    blobs: Arc<dyn BlobStore>,
    tasks: Arc<dyn TaskStatusStore>,
    publisher: Arc<dyn MessagePublisher>,
}

impl Processor {
    pub fn new(
        definition: Arc<PipelineDefinition>,
        registry: Arc<HandlerRegistry>,
        blobs: Arc<dyn BlobStore>,
        tasks: Arc<dyn TaskStatusStore>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            definition,
            registry,
            blobs,
            tasks,
            publisher,
        }
    }

    /// Handles one decoded envelope end to end.
    pub async fn process(&self, envelope: &TaskEnvelope) -> Disposition {
        let mut state = ProcessingState::Received;
        match self.advance(envelope, &mut state).await {
            Ok(()) => {
                debug!(state = ?ProcessingState::Acked, "Delivery processed");
                Disposition::Ack
            }
            Err(e) => {
                error!(
                    failure_kind = %e.kind(),
                    state = ?state,
                    error = %e,
                    "Stage failed; rejecting message"
                );
                mark_failed(self.tasks.as_ref(), &envelope.task_id, &envelope.stage_name).await;
                Disposition::Reject
            }
        }
    }

    async fn advance(
        &self,
        envelope: &TaskEnvelope,
        state: &mut ProcessingState,
    ) -> Result<(), ProcessError> {
        let stage = &envelope.stage_name;
        let task_id = &envelope.task_id;

        let locator = envelope
            .resource_locator
            .as_ref()
            .ok_or(ProcessError::MissingLocator)?;
        let handler = self
            .registry
            .resolve(stage.as_str())
            .ok_or_else(|| ProcessError::NoHandler(stage.clone()))?;
        let info = self
            .definition
            .stage(stage.as_str())
            .ok_or_else(|| ProcessError::UnknownStage(stage.clone()))?;
        *state = ProcessingState::Validated;

        let output = AssertUnwindSafe(handler.handle(task_id, locator))
            .catch_unwind()
            .await
            .map_err(|panic| ProcessError::Panicked {
                stage: stage.clone(),
                message: panic_message(panic.as_ref()),
            })??;
        *state = ProcessingState::Handled;

        let object = info.object_key(task_id);
        self.blobs
            .put(&info.bucket_name, &object, output.payload)
            .await?;
        *state = ProcessingState::Persisted;

        let next = envelope.forward(self.definition.next_stage_name(info), output.locator);
        let body = next.encode().map_err(ProcessError::Encode)?;
        let route = self.definition.route(info);

        self.tasks
            .update(TaskUpdate::in_progress(task_id.clone(), stage.clone()))
            .await?;
        self.publisher
            .publish(&route.exchange, &route.routing_key, body)
            .await?;
        *state = ProcessingState::Published;
        info!(
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            queue = %route.queue,
            next_stage = %next.stage_name,
            bucket = %info.bucket_name,
            object = %object,
            "Stage output published"
        );
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Records `FAILED` at `stage`; a failure to do so is only logged.
pub(crate) async fn mark_failed(tasks: &dyn TaskStatusStore, task_id: &TaskId, stage: &StageName) {
    if let Err(e) = tasks
        .update(TaskUpdate::failed(task_id.clone(), stage.clone()))
        .await
    {
        warn!(task_id = %task_id, stage = %stage, error = %e, "Could not mark task as failed");
    }
}

/// Decodes a delivery body. Attributable decode failures (a known task with
/// an unparsable locator) are marked `FAILED` before returning `None`.
pub(crate) async fn decode_or_fail(body: &[u8], tasks: &dyn TaskStatusStore) -> Option<TaskEnvelope> {
    match TaskEnvelope::decode(body) {
        Ok(envelope) => Some(envelope),
        Err(EnvelopeError::InvalidLocator {
            task_id,
            stage,
            raw,
            source,
        }) => {
            error!(
                task_id = %task_id,
                stage = %stage,
                locator = %raw,
                error = %source,
                failure_kind = %FailureKind::ResourceInvalid,
                "Envelope carries an invalid resource locator; rejecting message"
            );
            mark_failed(tasks, &task_id, &stage).await;
            None
        }
        Err(e) => {
            error!(
                failure_kind = %FailureKind::Decode,
                error = %e,
                body = %String::from_utf8_lossy(body),
                "Dropping undecodable message"
            );
            None
        }
    }
}

#[async_trait]
impl DeliveryHandler for Processor {
    async fn on_delivery(&self, body: &[u8]) -> Disposition {
        let Some(envelope) = decode_or_fail(body, self.tasks.as_ref()).await else {
            return Disposition::Reject;
        };
        let span = info_span!(
            "process",
            task_id = %envelope.task_id,
            stage = %envelope.stage_name
        );
        self.process(&envelope).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{definition, RecordingPublisher};
    use pipeline::{
        ResourceLocator, StageHandler, StageOutput, TaskCreate, TaskStatus,
    };
    use storage::MemoryBlobStore;
    use tasks::MemoryTaskStore;

    /// Returns a fixed payload, or a handler error for `fail`.
    struct Scripted {
        stage: StageName,
        payload: &'static [u8],
        next: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl StageHandler for Scripted {
        async fn handle(
            &self,
            _task_id: &TaskId,
            _locator: &ResourceLocator,
        ) -> Result<StageOutput, StageError> {
            if self.fail {
                return Err(StageError::handler(&self.stage, "invalid JSON format"));
            }
            Ok(StageOutput {
                payload: self.payload.to_vec(),
                locator: self.next.parse().unwrap(),
            })
        }
    }

    /// Indexes past the end of an empty list.
    struct Boom;

    #[async_trait]
    impl StageHandler for Boom {
        async fn handle(
            &self,
            _task_id: &TaskId,
            _locator: &ResourceLocator,
        ) -> Result<StageOutput, StageError> {
            let docs: Vec<u8> = Vec::new();
            let first = docs[0];
            Ok(StageOutput {
                payload: vec![first],
                locator: "minio://arxiv/raw/t1_raw.json".parse().unwrap(),
            })
        }
    }

    /// Records the task's status at the moment of each publish.
    struct StatusAtPublish {
        tasks: Arc<MemoryTaskStore>,
        seen: std::sync::Mutex<Vec<(TaskStatus, String)>>,
    }

    #[async_trait]
    impl MessagePublisher for StatusAtPublish {
        async fn publish(
            &self,
            _exchange: &pipeline::ExchangeName,
            _routing_key: &pipeline::RoutingKey,
            _body: Vec<u8>,
        ) -> Result<(), pipeline::InfrastructureError> {
            let record = self.tasks.get(&TaskId::new("t1").unwrap()).await?.unwrap();
            self.seen
                .lock()
                .unwrap()
                .push((record.status, record.phase.to_string()));
            Ok(())
        }
    }

    struct Harness {
        processor: Processor,
        blobs: Arc<MemoryBlobStore>,
        tasks: Arc<MemoryTaskStore>,
        publisher: Arc<RecordingPublisher>,
    }

    fn stage(name: &str) -> StageName {
        StageName::new(name).unwrap()
    }

    fn scripted(name: &str, next: &'static str, fail: bool) -> Arc<dyn StageHandler> {
        Arc::new(Scripted {
            stage: stage(name),
            payload: b"P1",
            next,
            fail,
        })
    }

    async fn harness(handlers: Vec<(&str, Arc<dyn StageHandler>)>, publisher: RecordingPublisher) -> Harness {
        let mut registry = HandlerRegistry::new();
        for (name, handler) in handlers {
            registry.register(stage(name), handler).unwrap();
        }
        let blobs = Arc::new(MemoryBlobStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        tasks
            .create(TaskCreate::pending(TaskId::new("t1").unwrap(), "arxiv", stage("crawler")))
            .await
            .unwrap();
        let publisher = Arc::new(publisher);
        let processor = Processor::new(
            Arc::new(definition()),
            Arc::new(registry),
            blobs.clone(),
            tasks.clone(),
            publisher.clone(),
        );
        Harness {
            processor,
            blobs,
            tasks,
            publisher,
        }
    }

    fn envelope(stage_name: &str, locator: Option<&str>) -> Vec<u8> {
        let mut doc = serde_json::json!({"task_id": "t1", "stage_name": stage_name});
        if let Some(locator) = locator {
            doc["resource_locator"] = locator.into();
        }
        serde_json::to_vec(&doc).unwrap()
    }

    async fn status(h: &Harness) -> (TaskStatus, String) {
        let record = h.tasks.get(&TaskId::new("t1").unwrap()).await.unwrap().unwrap();
        (record.status, record.phase.to_string())
    }

    #[tokio::test]
    async fn success_stores_publishes_and_advances_status() {
        let h = harness(
            vec![("crawler", scripted("crawler", "minio://arxiv/raw/t1_raw.json", false))],
            RecordingPublisher::default(),
        )
        .await;

        let disposition = h
            .processor
            .on_delivery(&envelope("crawler", Some("web://arxiv?query=x&limit=1")))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(h.blobs.get("raw", "t1_raw.json").await.unwrap(), Some(b"P1".to_vec()));

        let published = h.publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, body) = &published[0];
        assert_eq!((exchange.as_str(), routing_key.as_str()), ("index", "index.crawler"));
        let next = TaskEnvelope::decode(body).unwrap();
        assert_eq!(next.task_id.as_str(), "t1");
        assert_eq!(next.stage_name.as_str(), "parser");
        assert_eq!(
            next.resource_locator.unwrap().to_string(),
            "minio://arxiv/raw/t1_raw.json"
        );

        assert_eq!(status(&h).await, (TaskStatus::InProgress, "crawler".into()));
    }

    #[tokio::test]
    async fn last_stage_hands_off_to_the_builder() {
        let h = harness(
            vec![("extractor", scripted("extractor", "minio://arxiv/graph/t1_graph.json", false))],
            RecordingPublisher::default(),
        )
        .await;

        let disposition = h
            .processor
            .on_delivery(&envelope("extractor", Some("minio://arxiv/chunks/t1_chunks.json")))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        let published = h.publisher.published.lock().unwrap().clone();
        assert_eq!(published[0].1, "build.extractor");
        let next = TaskEnvelope::decode(&published[0].2).unwrap();
        assert_eq!(next.stage_name.as_str(), "builder");
        assert_eq!(status(&h).await, (TaskStatus::InProgress, "extractor".into()));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_task_without_publishing() {
        let h = harness(Vec::new(), RecordingPublisher::default()).await;

        let disposition = h
            .processor
            .on_delivery(&envelope("parser", Some("minio://arxiv/raw/t1_raw.json")))
            .await;

        assert_eq!(disposition, Disposition::Reject);
        assert!(h.publisher.published.lock().unwrap().is_empty());
        assert_eq!(status(&h).await, (TaskStatus::Failed, "parser".into()));
    }

    #[tokio::test]
    async fn handler_error_fails_the_task_at_its_stage() {
        let h = harness(
            vec![("extractor", scripted("extractor", "minio://arxiv/graph/x", true))],
            RecordingPublisher::default(),
        )
        .await;

        let disposition = h
            .processor
            .on_delivery(&envelope("extractor", Some("minio://arxiv/chunks/t1_chunks.json")))
            .await;

        assert_eq!(disposition, Disposition::Reject);
        assert!(h.publisher.published.lock().unwrap().is_empty());
        assert!(h.blobs.is_empty());
        assert_eq!(status(&h).await, (TaskStatus::Failed, "extractor".into()));
    }

    #[tokio::test]
    async fn missing_locator_fails_the_task() {
        let h = harness(
            vec![("parser", scripted("parser", "minio://arxiv/parsed/x", false))],
            RecordingPublisher::default(),
        )
        .await;

        let disposition = h.processor.on_delivery(&envelope("parser", None)).await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(status(&h).await, (TaskStatus::Failed, "parser".into()));
    }

    #[tokio::test]
    async fn unparsable_locator_fails_the_task() {
        let h = harness(Vec::new(), RecordingPublisher::default()).await;

        let disposition = h
            .processor
            .on_delivery(&envelope("parser", Some("not a locator")))
            .await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(status(&h).await, (TaskStatus::Failed, "parser".into()));
    }

    #[tokio::test]
    async fn undecodable_message_is_rejected_without_status_change() {
        let h = harness(Vec::new(), RecordingPublisher::default()).await;

        let disposition = h.processor.on_delivery(b"{\"oops\": true").await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(status(&h).await, (TaskStatus::Pending, "crawler".into()));
    }

    #[tokio::test]
    async fn publish_failure_rejects_and_fails_the_task() {
        let h = harness(
            vec![("crawler", scripted("crawler", "minio://arxiv/raw/t1_raw.json", false))],
            RecordingPublisher {
                fail: true,
                ..Default::default()
            },
        )
        .await;

        let disposition = h
            .processor
            .on_delivery(&envelope("crawler", Some("web://arxiv?query=x&limit=1")))
            .await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(status(&h).await, (TaskStatus::Failed, "crawler".into()));
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_task() {
        let h = harness(vec![("crawler", Arc::new(Boom) as Arc<dyn StageHandler>)], RecordingPublisher::default())
            .await;

        let disposition = h
            .processor
            .on_delivery(&envelope("crawler", Some("web://arxiv?query=x&limit=1")))
            .await;

        assert_eq!(disposition, Disposition::Reject);
        assert!(h.publisher.published.lock().unwrap().is_empty());
        assert!(h.blobs.is_empty());
        assert_eq!(status(&h).await, (TaskStatus::Failed, "crawler".into()));
    }

    #[tokio::test]
    async fn progress_is_recorded_before_the_next_stage_sees_the_envelope() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(stage("crawler"), scripted("crawler", "minio://arxiv/raw/t1_raw.json", false))
            .unwrap();
        let tasks = Arc::new(MemoryTaskStore::new());
        tasks
            .create(TaskCreate::pending(TaskId::new("t1").unwrap(), "arxiv", stage("crawler")))
            .await
            .unwrap();
        let publisher = Arc::new(StatusAtPublish {
            tasks: tasks.clone(),
            seen: Default::default(),
        });
        let processor = Processor::new(
            Arc::new(definition()),
            Arc::new(registry),
            Arc::new(MemoryBlobStore::new()),
            tasks,
            publisher.clone(),
        );

        let disposition = processor
            .on_delivery(&envelope("crawler", Some("web://arxiv?query=x&limit=1")))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(
            *publisher.seen.lock().unwrap(),
            vec![(TaskStatus::InProgress, "crawler".to_string())]
        );
    }

    #[test]
    fn error_kinds_follow_the_taxonomy() {
        assert_eq!(ProcessError::MissingLocator.kind(), FailureKind::Validation);
        assert_eq!(ProcessError::NoHandler(stage("x")).kind(), FailureKind::Validation);
        let resource = ProcessError::from(StageError::resource_invalid("web://x?q=1", "bad host"));
        assert_eq!(resource.kind(), FailureKind::ResourceInvalid);
        let infra = ProcessError::from(pipeline::InfrastructureError::Bus("down".into()));
        assert_eq!(infra.kind(), FailureKind::Infrastructure);
        let panicked = ProcessError::Panicked {
            stage: stage("crawler"),
            message: "index out of bounds".into(),
        };
        assert_eq!(panicked.kind(), FailureKind::Handler);
    }
}
