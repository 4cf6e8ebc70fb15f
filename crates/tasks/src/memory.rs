use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pipeline::{
    InfrastructureError, TaskCreate, TaskId, TaskStatusRecord, TaskStatusStore, TaskUpdate,
    Timestamp,
};
use tracing::info;

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<TaskId, TaskStatusRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskStatusRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl TaskStatusStore for MemoryTaskStore {
    async fn create(&self, task: TaskCreate) -> Result<(), InfrastructureError> {
        let mut records = self.lock();
        if records.contains_key(&task.task_id) {
            return Err(InfrastructureError::StatusStore(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        let now = Timestamp::now();
        info!(task_id = %task.task_id, status = %task.status, phase = %task.phase, "Task created");
        records.insert(
            task.task_id.clone(),
            TaskStatusRecord {
                task_id: task.task_id,
                status: task.status,
                department: task.department,
                phase: task.phase,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update(&self, update: TaskUpdate) -> Result<(), InfrastructureError> {
        let mut records = self.lock();
        let record = records
            .get_mut(&update.task_id)
            .ok_or_else(|| InfrastructureError::TaskNotFound(update.task_id.clone()))?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(department) = update.department {
            record.department = department;
        }
        if let Some(phase) = update.phase {
            record.phase = phase;
        }
        record.updated_at = Timestamp::now();
        info!(
            task_id = %record.task_id,
            status = %record.status,
            phase = %record.phase,
            "Task updated"
        );
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>, InfrastructureError> {
        Ok(self.lock().get(task_id).cloned())
    }
}
