//! Pipeline entry point.

use std::sync::Arc;

use pipeline::{
    InfrastructureError, Metadata, MessagePublisher, PipelineDefinition, ResourceLocator,
    TaskCreate, TaskEnvelope, TaskId, TaskStatusStore,
};
use tracing::info;

/// Creates tasks and publishes their first envelope.
#[derive(Clone)]
pub struct TaskSubmitter {
    definition: Arc<PipelineDefinition>,
    tasks: Arc<dyn TaskStatusStore>,
    publisher: Arc<dyn MessagePublisher>,
}

impl TaskSubmitter {
    pub fn new(
        definition: Arc<PipelineDefinition>,
        tasks: Arc<dyn TaskStatusStore>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            definition,
            tasks,
            publisher,
        }
    }

    /// Registers a `PENDING` task at the first stage, then publishes its
    /// envelope under the first stage's routing key. Returns the new task id.
    pub async fn submit(
        &self,
        department: &str,
        locator: ResourceLocator,
        metadata: Metadata,
    ) -> Result<TaskId, InfrastructureError> {
        let task_id = TaskId::generate();
        let (stage, info) = self.definition.first_stage();

        self.tasks
            .create(TaskCreate::pending(task_id.clone(), department, stage.clone()))
            .await?;

        let envelope = TaskEnvelope::new(task_id.clone(), stage.clone(), locator)
            .with_metadata(metadata);
        let body = envelope
            .encode()
            .map_err(|e| InfrastructureError::Bus(format!("could not encode envelope: {e}")))?;
        self.publisher
            .publish(self.definition.exchange_name(), &info.routing_key, body)
            .await?;

        info!(
            task_id = %task_id,
            stage = %stage,
            department,
            routing_key = %info.routing_key,
            "Task submitted"
        );
        Ok(task_id)
    }
}
