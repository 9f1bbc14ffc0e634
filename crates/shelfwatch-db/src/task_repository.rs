use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use shelfwatch_core::error::AppError;
use shelfwatch_core::retry::ErrorKind;
use shelfwatch_core::store::{ErrorSink, TaskStore};
use shelfwatch_core::task::{
    CreateTaskRequest, ErrorRecord, Task, TaskPriority, TaskStatus, TaskType,
};

/// PostgreSQL-backed task store. Each method is a single statement, so
/// concurrent scheduler workers get single-writer-at-a-time semantics
/// per task row from ordinary row locking.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: Pool<Postgres>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct CrawlTaskRow {
    id: Uuid,
    task_type: String,
    status: String,
    priority: String,
    owner_id: Uuid,
    payload: serde_json::Value,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    progress: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<CrawlTaskRow> for Task {
    fn from(row: CrawlTaskRow) -> Self {
        Task {
            id: row.id,
            task_type: row.task_type.parse().unwrap_or(TaskType::ProductCrawl),
            status: row.status.parse().unwrap_or(TaskStatus::Pending),
            priority: row.priority.parse().unwrap_or(TaskPriority::Normal),
            owner_id: row.owner_id,
            payload: row.payload,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            error_message: row.error_message,
            progress: row.progress.clamp(0, 100) as u8,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskErrorRow {
    id: Uuid,
    task_id: Option<Uuid>,
    kind: String,
    message: String,
    detail: serde_json::Value,
    occurred_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolution_action: Option<String>,
}

impl From<TaskErrorRow> for ErrorRecord {
    fn from(row: TaskErrorRow) -> Self {
        ErrorRecord {
            id: row.id,
            task_id: row.task_id,
            kind: row.kind.parse().unwrap_or(ErrorKind::Other),
            message: row.message,
            detail: row.detail,
            occurred_at: row.occurred_at,
            resolved_at: row.resolved_at,
            resolution_action: row.resolution_action,
        }
    }
}

impl ErrorSink for PgTaskStore {
    async fn upsert_unresolved_error(
        &self,
        task_id: Option<Uuid>,
        kind: ErrorKind,
        message: &str,
        detail: serde_json::Value,
    ) -> Result<Uuid, AppError> {
        // The partial unique index on (task_id) WHERE resolved_at IS NULL
        // makes this keep at most one live record per task.
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO task_errors (task_id, kind, message, detail)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_id) WHERE resolved_at IS NULL
            DO UPDATE SET
                kind = EXCLUDED.kind,
                message = EXCLUDED.message,
                detail = EXCLUDED.detail,
                occurred_at = NOW()
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(kind.as_str())
        .bind(message)
        .bind(&detail)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(?task_id, kind = kind.as_str(), "Error record upserted");
        Ok(id)
    }

    async fn resolve_errors(
        &self,
        task_id: Uuid,
        resolution_action: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE task_errors
            SET resolved_at = NOW(), resolution_action = $2
            WHERE task_id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(task_id)
        .bind(resolution_action)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let resolved = result.rows_affected();
        if resolved > 0 {
            tracing::debug!(%task_id, resolved, resolution_action, "Error records resolved");
        }
        Ok(resolved)
    }
}

impl TaskStore for PgTaskStore {
    async fn insert(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let row = sqlx::query_as::<_, CrawlTaskRow>(
            r#"
            INSERT INTO crawl_tasks (task_type, priority, owner_id, payload, max_retries)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(request.task_type.as_str())
        .bind(request.priority.as_str())
        .bind(request.owner_id)
        .bind(&request.payload)
        .bind(request.max_retries as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        let row = sqlx::query_as::<_, CrawlTaskRow>("SELECT * FROM crawl_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE crawl_tasks
            SET status = $2,
                error_message = $3,
                updated_at = NOW(),
                completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn set_progress(&self, task_id: Uuid, progress: u8) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE crawl_tasks
            SET progress = LEAST($2::smallint, 100), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(progress.min(100) as i16)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn reset_for_retry(&self, task_id: Uuid) -> Result<Task, AppError> {
        let row = sqlx::query_as::<_, CrawlTaskRow>(
            r#"
            UPDATE crawl_tasks
            SET status = 'pending',
                retry_count = retry_count + 1,
                priority = 'high',
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let task: Task = row.into();
        tracing::info!(%task_id, retry_count = task.retry_count, "Task reset for retry");
        Ok(task)
    }

    async fn load_resumable(&self) -> Result<Vec<Task>, AppError> {
        let rows = sqlx::query_as::<_, CrawlTaskRow>(
            r#"
            SELECT * FROM crawl_tasks
            WHERE status = 'pending'
            ORDER BY
                CASE priority WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END,
                created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_failed_retryable(&self, limit: usize) -> Result<Vec<Task>, AppError> {
        let rows = sqlx::query_as::<_, CrawlTaskRow>(
            r#"
            SELECT * FROM crawl_tasks
            WHERE status = 'failed' AND retry_count < max_retries
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM crawl_tasks WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    async fn list_unresolved_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, AppError> {
        let rows = sqlx::query_as::<_, TaskErrorRow>(
            r#"
            SELECT * FROM task_errors
            WHERE resolved_at IS NULL
            ORDER BY occurred_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
