use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::retry::ErrorKind;
use crate::task::{CreateTaskRequest, ErrorRecord, Task, TaskStatus};

/// Sink for classified failure records.
///
/// Split out of [`TaskStore`] so the retry policy only depends on the one
/// capability it needs.
pub trait ErrorSink: Send + Sync {
    /// Record a classified failure against a task.
    ///
    /// If the task already has an unresolved record, it is updated in
    /// place (kind, message, detail, occurred_at) instead of appending,
    /// keeping per-task diagnostics bounded. Returns the record id.
    fn upsert_unresolved_error(
        &self,
        task_id: Option<Uuid>,
        kind: ErrorKind,
        message: &str,
        detail: serde_json::Value,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Mark all unresolved records for a task as resolved.
    fn resolve_errors(
        &self,
        task_id: Uuid,
        resolution_action: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Durable record of tasks.
///
/// Implementations must make each call transactional: concurrent
/// scheduler workers rely on single-writer-at-a-time semantics per task
/// row.
pub trait TaskStore: ErrorSink + Clone {
    /// Persist a new task with status `Pending`. Returns the full row.
    fn insert(
        &self,
        request: CreateTaskRequest,
    ) -> impl Future<Output = Result<Task, AppError>> + Send;

    fn get(&self, task_id: Uuid) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Persist a status change. Sets `completed_at` only on `Completed`.
    fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Update handler-reported progress (0–100).
    fn set_progress(
        &self,
        task_id: Uuid,
        progress: u8,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Reset a failed task for another attempt: status back to `Pending`,
    /// `retry_count + 1`, priority raised to high, error message cleared.
    /// Returns the updated row.
    fn reset_for_retry(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// All `Pending` tasks ordered by (priority rank, created_at), for
    /// startup resume.
    fn load_resumable(&self) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    /// `Failed` tasks with `retry_count < max_retries`, oldest first,
    /// for the batch sweep.
    fn list_failed_retryable(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: TaskStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// Unresolved error records, newest first (diagnostics surface).
    fn list_unresolved_errors(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ErrorRecord>, AppError>> + Send;
}
