use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline::{
    InfrastructureError, StageName, TaskCreate, TaskId, TaskStatus, TaskStatusRecord,
    TaskStatusStore, TaskUpdate, Timestamp,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    department TEXT NOT NULL,
    phase TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

fn db_error(action: &str, error: sqlx::Error) -> InfrastructureError {
    InfrastructureError::StatusStore(format!("{action}: {error}"))
}

/// Task status records in a `tasks` table.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Connects and creates the `tasks` table if it does not exist.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, InfrastructureError> {
        if url.trim().is_empty() {
            return Err(InfrastructureError::StatusStore(
                "database url must not be empty".into(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| db_error("connect to postgres", e))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, InfrastructureError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| db_error("create tasks table", e))?;
        Ok(Self { pool })
    }
}

fn map_row(row: PgRow) -> Result<TaskStatusRecord, InfrastructureError> {
    let column = |e| db_error("read task row", e);

    let id: String = row.try_get("id").map_err(column)?;
    let status: String = row.try_get("status").map_err(column)?;
    let department: String = row.try_get("department").map_err(column)?;
    let phase: String = row.try_get("phase").map_err(column)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(column)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(column)?;

    let invalid = |field: &str, value: &str| {
        InfrastructureError::StatusStore(format!("invalid {field} '{value}' in tasks row"))
    };
    Ok(TaskStatusRecord {
        task_id: TaskId::new(id.as_str()).ok_or_else(|| invalid("id", &id))?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|_| invalid("status", &status))?,
        department,
        phase: StageName::new(phase.as_str()).ok_or_else(|| invalid("phase", &phase))?,
        created_at: Timestamp::from_utc(created_at),
        updated_at: Timestamp::from_utc(updated_at),
    })
}

#[async_trait]
impl TaskStatusStore for PostgresTaskStore {
    async fn create(&self, task: TaskCreate) -> Result<(), InfrastructureError> {
        sqlx::query("INSERT INTO tasks (id, status, department, phase) VALUES ($1, $2, $3, $4)")
            .bind(task.task_id.as_str())
            .bind(task.status.as_str())
            .bind(&task.department)
            .bind(task.phase.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("insert task", e))?;
        info!(task_id = %task.task_id, status = %task.status, phase = %task.phase, "Task created");
        Ok(())
    }

    async fn update(&self, update: TaskUpdate) -> Result<(), InfrastructureError> {
        let result = sqlx::query(
            "UPDATE tasks SET \
                status = COALESCE($2, status), \
                department = COALESCE($3, department), \
                phase = COALESCE($4, phase), \
                updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(update.task_id.as_str())
        .bind(update.status.map(TaskStatus::as_str))
        .bind(update.department.as_deref())
        .bind(update.phase.as_ref().map(StageName::as_str))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update task", e))?;

        if result.rows_affected() == 0 {
            return Err(InfrastructureError::TaskNotFound(update.task_id));
        }
        info!(
            task_id = %update.task_id,
            status = update.status.map(TaskStatus::as_str),
            phase = update.phase.as_ref().map(StageName::as_str),
            "Task updated"
        );
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>, InfrastructureError> {
        let row = sqlx::query(
            "SELECT id, status, department, phase, created_at, updated_at FROM tasks WHERE id = $1",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("select task", e))?;

        row.map(map_row).transpose()
    }
}
