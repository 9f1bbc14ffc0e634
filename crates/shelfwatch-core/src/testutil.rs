//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::rank::{ListingFetcher, ListingItem};
use crate::resource::{ProviderError, ResourceProvider};
use crate::retry::ErrorKind;
use crate::scheduler::{SchedulerEvent, SchedulerReporter};
use crate::store::{ErrorSink, TaskStore};
use crate::task::{CreateTaskRequest, ErrorRecord, Task, TaskPriority, TaskStatus, TaskType};

/// Shorthand for a create request with a throwaway owner and payload.
pub fn make_request(task_type: TaskType) -> CreateTaskRequest {
    CreateTaskRequest::new(
        task_type,
        Uuid::new_v4(),
        serde_json::json!({"keyword": "wireless mouse"}),
    )
}

// ---------------------------------------------------------------------------
// MemoryTaskStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<Uuid, Task>,
    errors: Vec<ErrorRecord>,
}

/// In-memory [`TaskStore`] mirroring the Postgres-backed one.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unresolved_error_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .errors
            .iter()
            .filter(|e| e.resolved_at.is_none())
            .count()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }
}

impl ErrorSink for MemoryTaskStore {
    async fn upsert_unresolved_error(
        &self,
        task_id: Option<Uuid>,
        kind: ErrorKind,
        message: &str,
        detail: serde_json::Value,
    ) -> Result<Uuid, AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .errors
            .iter_mut()
            .find(|e| e.task_id == task_id && e.task_id.is_some() && e.resolved_at.is_none())
        {
            existing.kind = kind;
            existing.message = message.to_string();
            existing.detail = detail;
            existing.occurred_at = Utc::now();
            return Ok(existing.id);
        }
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            task_id,
            kind,
            message: message.to_string(),
            detail,
            occurred_at: Utc::now(),
            resolved_at: None,
            resolution_action: None,
        };
        let id = record.id;
        inner.errors.push(record);
        Ok(id)
    }

    async fn resolve_errors(
        &self,
        task_id: Uuid,
        resolution_action: &str,
    ) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let mut resolved = 0;
        for record in inner
            .errors
            .iter_mut()
            .filter(|e| e.task_id == Some(task_id) && e.resolved_at.is_none())
        {
            record.resolved_at = Some(Utc::now());
            record.resolution_action = Some(resolution_action.to_string());
            resolved += 1;
        }
        Ok(resolved)
    }
}

impl TaskStore for MemoryTaskStore {
    async fn insert(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            task_type: request.task_type,
            status: TaskStatus::Pending,
            priority: request.priority,
            owner_id: request.owner_id,
            payload: request.payload,
            retry_count: 0,
            max_retries: request.max_retries,
            error_message: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner
            .lock()
            .unwrap()
            .tasks
            .insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(self.inner.lock().unwrap().tasks.get(&task_id).cloned())
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::DatabaseError(format!("task not found: {task_id}")))?;
        task.status = status;
        task.error_message = error_message.map(str::to_string);
        task.updated_at = Utc::now();
        if status == TaskStatus::Completed {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_progress(&self, task_id: Uuid, progress: u8) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::DatabaseError(format!("task not found: {task_id}")))?;
        task.progress = progress.min(100);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_for_retry(&self, task_id: Uuid) -> Result<Task, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::DatabaseError(format!("task not found: {task_id}")))?;
        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.priority = TaskPriority::High;
        task.error_message = None;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn load_resumable(&self) -> Result<Vec<Task>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.priority.rank(), t.created_at));
        Ok(tasks)
    }

    async fn list_failed_retryable(&self, limit: usize) -> Result<Vec<Task>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.retry_count < t.max_retries)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.values().filter(|t| t.status == status).count() as i64)
    }

    async fn list_unresolved_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut errors: Vec<ErrorRecord> = inner
            .errors
            .iter()
            .filter(|e| e.resolved_at.is_none())
            .cloned()
            .collect();
        errors.sort_by_key(|e| std::cmp::Reverse(e.occurred_at));
        errors.truncate(limit);
        Ok(errors)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

enum OpenScript {
    Healthy,
    Scripted(VecDeque<Result<String, ProviderError>>),
    AlwaysFail,
}

/// Mock window-farm backend with scriptable open results.
#[derive(Clone)]
pub struct MockProvider {
    script: Arc<Mutex<OpenScript>>,
    probe_ok: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockProvider {
    /// Every open succeeds with a generated connection reference.
    pub fn healthy() -> Self {
        Self::with_script(OpenScript::Healthy)
    }

    /// Opens consume the given results in order; once exhausted, further
    /// opens succeed with generated references.
    pub fn with_open_results(results: Vec<Result<String, ProviderError>>) -> Self {
        Self::with_script(OpenScript::Scripted(results.into()))
    }

    pub fn always_failing_open() -> Self {
        Self::with_script(OpenScript::AlwaysFail)
    }

    fn with_script(script: OpenScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            probe_ok: Arc::new(AtomicBool::new(true)),
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_probe_result(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ResourceProvider for MockProvider {
    async fn open(&self, handle_id: &str) -> Result<String, ProviderError> {
        let count = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let mut script = self.script.lock().unwrap();
        match &mut *script {
            OpenScript::Healthy => Ok(format!("ws://{handle_id}/{count}")),
            OpenScript::Scripted(results) => results
                .pop_front()
                .unwrap_or_else(|| Ok(format!("ws://{handle_id}/{count}"))),
            OpenScript::AlwaysFail => Err(ProviderError::Failed("window farm unavailable".into())),
        }
    }

    async fn close(&self, _handle_id: &str) -> Result<(), ProviderError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _conn_ref: &str) -> bool {
        self.probe_ok.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MockListingFetcher
// ---------------------------------------------------------------------------

/// Mock listing fetcher serving pre-built pages, with an optional
/// artificial delay to exercise single-flight behavior.
#[derive(Clone)]
pub struct MockListingFetcher {
    pages: Arc<Vec<Vec<ListingItem>>>,
    delay: Duration,
    pub fetch_calls: Arc<AtomicUsize>,
}

impl MockListingFetcher {
    pub fn with_pages(pages: Vec<Vec<ListingItem>>) -> Self {
        Self {
            pages: Arc::new(pages),
            delay: Duration::ZERO,
            fetch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ListingFetcher for MockListingFetcher {
    async fn fetch_page(
        &self,
        _page_url: &str,
        page_number: u32,
    ) -> Result<Vec<ListingItem>, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .pages
            .get(page_number as usize - 1)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records compact event labels for assertions.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    labels: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

impl SchedulerReporter for RecordingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match event {
            SchedulerEvent::WorkerStarted { .. } => "worker_started",
            SchedulerEvent::WorkerStopped { .. } => "worker_stopped",
            SchedulerEvent::TaskStarted { .. } => "task_started",
            SchedulerEvent::TaskCompleted { .. } => "task_completed",
            SchedulerEvent::TaskFailed { .. } => "task_failed",
            SchedulerEvent::TaskTimedOut { .. } => "task_timed_out",
            SchedulerEvent::SweepCompleted { .. } => "sweep_completed",
        };
        self.labels.lock().unwrap().push(label.to_string());
    }
}
