//! Task status records and the read-side progress projection.
//!
//! A record stores only a status and a phase (stage name). [`project`]
//! reconstructs per-stage progress from those two fields and the pipeline
//! definition; [`StatusPoller`] combines a point lookup with the projection
//! for the status-polling surface.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::InfrastructureError;
use crate::ports::TaskStatusStore;
use crate::{PipelineDefinition, StageName, TaskId, Timestamp};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Durable status of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub department: String,
    /// Stage most recently entered, or the terminal marker.
    pub phase: StageName,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Request to create a status record.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCreate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub department: String,
    pub phase: StageName,
}

impl TaskCreate {
    /// A freshly submitted task waiting at `phase`.
    pub fn pending(task_id: TaskId, department: impl Into<String>, phase: StageName) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            department: department.into(),
            phase,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub status: Option<TaskStatus>,
    pub department: Option<String>,
    pub phase: Option<StageName>,
}

impl TaskUpdate {
    fn transition(task_id: TaskId, status: TaskStatus, phase: StageName) -> Self {
        Self {
            task_id,
            status: Some(status),
            department: None,
            phase: Some(phase),
        }
    }

    /// `phase` finished successfully and its output was handed on.
    pub fn in_progress(task_id: TaskId, phase: StageName) -> Self {
        Self::transition(task_id, TaskStatus::InProgress, phase)
    }

    /// `phase` failed; the task stops there.
    pub fn failed(task_id: TaskId, phase: StageName) -> Self {
        Self::transition(task_id, TaskStatus::Failed, phase)
    }

    /// The terminal builder materialised the task's graph.
    pub fn completed(task_id: TaskId, phase: StageName) -> Self {
        Self::transition(task_id, TaskStatus::Completed, phase)
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Progress of a single stage as seen by a status poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One entry of a projected progress list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: StageName,
    pub order: usize,
    pub status: StageStatus,
}

/// Reconstructs per-stage progress for `record`.
///
/// The list covers every pipeline stage in order, followed by the terminal
/// marker. A phase that is not part of that list (stale record, changed
/// definition) yields an empty list, which callers report as "progress
/// unavailable".
pub fn project(record: &TaskStatusRecord, definition: &PipelineDefinition) -> Vec<StageProgress> {
    let stages = definition.progress_stages();
    let Some(current) = stages.iter().position(|stage| *stage == record.phase) else {
        return Vec::new();
    };

    stages
        .into_iter()
        .enumerate()
        .map(|(order, stage)| {
            let status = match record.status {
                TaskStatus::Pending => StageStatus::Pending,
                TaskStatus::Completed => StageStatus::Completed,
                TaskStatus::InProgress | TaskStatus::Failed if order < current => {
                    StageStatus::Completed
                }
                TaskStatus::InProgress if order == current => StageStatus::InProgress,
                TaskStatus::Failed if order == current => StageStatus::Failed,
                TaskStatus::InProgress | TaskStatus::Failed => StageStatus::Pending,
            };
            StageProgress {
                stage,
                order,
                status,
            }
        })
        .collect()
}

/// Status record plus its projected progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgressReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub phase: StageName,
    pub progress: Vec<StageProgress>,
}

/// Read side used by the status-polling surface.
#[derive(Clone)]
pub struct StatusPoller {
    store: Arc<dyn TaskStatusStore>,
    definition: Arc<PipelineDefinition>,
}

impl StatusPoller {
    pub fn new(store: Arc<dyn TaskStatusStore>, definition: Arc<PipelineDefinition>) -> Self {
        Self { store, definition }
    }

    /// Point lookup of the raw record.
    pub async fn record(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>, InfrastructureError> {
        self.store.get(task_id).await
    }

    /// Looks up `task_id` and projects its progress. `None` if unknown.
    pub async fn poll(&self, task_id: &TaskId) -> Result<Option<TaskProgressReport>, InfrastructureError> {
        let Some(record) = self.store.get(task_id).await? else {
            return Ok(None);
        };
        let progress = project(&record, &self.definition);
        Ok(Some(TaskProgressReport {
            task_id: record.task_id,
            status: record.status,
            phase: record.phase,
            progress,
        }))
    }
}
