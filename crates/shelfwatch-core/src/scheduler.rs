//! Worker-pool scheduler driving tasks through their lifecycle.
//!
//! Per task: `Pending -> Processing -> {Completed, Failed}`. A failed
//! task goes back to `Pending` only through an explicit retry or the
//! batch sweep, never by immediate re-enqueue, which bounds retry storms
//! when a handler is systematically broken.
//!
//! Workers poll the queue independently; execution itself runs on
//! spawned tasks bounded by a semaphore so a slow handler never blocks
//! the polling loops.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::queue::TaskQueue;
use crate::retry::{ErrorKind, RetryPolicy};
use crate::store::{ErrorSink, TaskStore};
use crate::task::{Task, TaskStatus, TaskType};

/// Hard cap on persisted error message length.
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Domain logic for one task type.
///
/// Handlers are expected to use the resource pool, retry policy and page
/// cache internally, and must not hold a window lease past their own
/// return.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub num_workers: usize,
    /// Tasks executing at once across all workers.
    pub max_concurrent: usize,
    /// Idle sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Sleep when all execution slots are taken.
    pub busy_backoff: Duration,
    /// Minimum spacing between batch-retry sweeps.
    pub sweep_interval: Duration,
    /// Failed tasks re-queued per sweep.
    pub sweep_limit: usize,
    /// Wall-clock ceiling per handler invocation.
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            max_concurrent: 10,
            poll_interval: Duration::from_millis(500),
            busy_backoff: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(10),
            sweep_limit: 50,
            task_timeout: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    WorkerStarted {
        worker_id: usize,
    },
    WorkerStopped {
        worker_id: usize,
    },
    TaskStarted {
        task_id: Uuid,
        task_type: TaskType,
    },
    TaskCompleted {
        task_id: Uuid,
        elapsed: Duration,
    },
    TaskFailed {
        task_id: Uuid,
        kind: ErrorKind,
        error: &'a str,
    },
    TaskTimedOut {
        task_id: Uuid,
        timeout_secs: u64,
    },
    SweepCompleted {
        requeued: usize,
    },
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::WorkerStarted { worker_id } => {
                tracing::info!(worker_id, "Scheduler worker started");
            }
            SchedulerEvent::WorkerStopped { worker_id } => {
                tracing::info!(worker_id, "Scheduler worker stopped");
            }
            SchedulerEvent::TaskStarted { task_id, task_type } => {
                tracing::info!(%task_id, %task_type, "Task started");
            }
            SchedulerEvent::TaskCompleted { task_id, elapsed } => {
                tracing::info!(%task_id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
            }
            SchedulerEvent::TaskFailed {
                task_id,
                kind,
                error,
            } => {
                tracing::warn!(%task_id, %kind, %error, "Task failed");
            }
            SchedulerEvent::TaskTimedOut {
                task_id,
                timeout_secs,
            } => {
                tracing::warn!(%task_id, timeout_secs, "Task timed out");
            }
            SchedulerEvent::SweepCompleted { requeued } => {
                tracing::info!(requeued, "Batch retry sweep re-queued failed tasks");
            }
        }
    }
}

// Everything the worker loops and spawned executions need, shared once
// `start` has snapshotted the handler table.
struct ExecContext<S: TaskStore, R: SchedulerReporter> {
    queue: Arc<TaskQueue<S>>,
    handlers: Arc<HashMap<TaskType, Arc<dyn TaskHandler>>>,
    policy: RetryPolicy,
    config: SchedulerConfig,
    reporter: R,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    last_sweep: StdMutex<Option<Instant>>,
}

/// Task scheduler: owns the worker loops and the handler registry.
pub struct Scheduler<S, R = TracingReporter>
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    queue: Arc<TaskQueue<S>>,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    policy: RetryPolicy,
    config: SchedulerConfig,
    reporter: R,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<S> Scheduler<S, TracingReporter>
where
    S: TaskStore + Send + Sync + 'static,
{
    pub fn new(queue: Arc<TaskQueue<S>>, policy: RetryPolicy, config: SchedulerConfig) -> Self {
        Self::with_reporter(queue, policy, config, TracingReporter)
    }
}

impl<S, R> Scheduler<S, R>
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    pub fn with_reporter(
        queue: Arc<TaskQueue<S>>,
        policy: RetryPolicy,
        config: SchedulerConfig,
        reporter: R,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            queue,
            handlers: HashMap::new(),
            policy,
            config,
            reporter,
            cancel: CancellationToken::new(),
            slots,
            workers: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register the handler for a task type. Must happen before
    /// [`start`](Self::start); a type dequeued without a handler fails
    /// immediately without retry.
    pub fn register_handler(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        if self.started.load(Ordering::SeqCst) {
            tracing::warn!(%task_type, "Handler registered after start, ignored");
            return;
        }
        self.handlers.insert(task_type, handler);
    }

    /// Spawn the worker loops. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Scheduler already started");
            return;
        }

        let ctx = Arc::new(ExecContext {
            queue: self.queue.clone(),
            handlers: Arc::new(self.handlers.clone()),
            policy: self.policy.clone(),
            config: self.config.clone(),
            reporter: self.reporter.clone(),
            cancel: self.cancel.clone(),
            slots: self.slots.clone(),
            last_sweep: StdMutex::new(None),
        });

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for worker_id in 0..self.config.num_workers {
            let ctx = ctx.clone();
            workers.push(tokio::spawn(worker_loop(ctx, worker_id)));
        }
        tracing::info!(num_workers = self.config.num_workers, "Scheduler started");
    }

    /// Signal the worker loops to exit; with `wait`, joins them. Spawned
    /// executions in flight run to completion either way.
    pub async fn stop(&self, wait: bool) {
        self.cancel.cancel();
        if wait {
            let handles: Vec<_> = {
                let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
                workers.drain(..).collect()
            };
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Re-queue a failed task on behalf of its owner.
    ///
    /// Fails closed: ownership mismatch, wrong status, a spent retry
    /// budget, a full queue or any store error all leave the task
    /// untouched and return `false`.
    pub async fn retry_task(&self, task_id: Uuid, owner_id: Uuid) -> bool {
        let store = self.queue.store();
        let task = match store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(%task_id, "Retry requested for unknown task");
                return false;
            }
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Failed to load task for retry");
                return false;
            }
        };

        if task.owner_id != owner_id {
            tracing::warn!(%task_id, %owner_id, "Retry denied, owner mismatch");
            return false;
        }
        if task.status != TaskStatus::Failed {
            tracing::debug!(%task_id, status = %task.status, "Retry denied, not in failed state");
            return false;
        }
        if !task.can_retry() {
            tracing::debug!(%task_id, retry_count = task.retry_count, "Retry denied, budget spent");
            return false;
        }
        if self.queue.is_full() {
            tracing::warn!(%task_id, "Retry denied, queue full");
            return false;
        }

        let reset = match store.reset_for_retry(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Failed to reset task for retry");
                return false;
            }
        };
        match self.queue.enqueue_existing(&reset) {
            Ok(()) => {
                tracing::info!(%task_id, retry_count = reset.retry_count, "Task re-queued");
                true
            }
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "Failed to re-queue task");
                false
            }
        }
    }

    /// Cancel a pending task on behalf of its owner. Tasks already
    /// dispatched keep running; only `Pending` tasks can be cancelled.
    pub async fn cancel_task(&self, task_id: Uuid, owner_id: Uuid) -> bool {
        let store = self.queue.store();
        let task = match store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) | Err(_) => return false,
        };

        if task.owner_id != owner_id {
            tracing::warn!(%task_id, %owner_id, "Cancel denied, owner mismatch");
            return false;
        }
        if task.status != TaskStatus::Pending {
            tracing::debug!(%task_id, status = %task.status, "Cancel denied, not pending");
            return false;
        }

        match store
            .update_status(task_id, TaskStatus::Cancelled, None)
            .await
        {
            Ok(()) => {
                tracing::info!(%task_id, "Task cancelled");
                true
            }
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Failed to cancel task");
                false
            }
        }
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent - self.slots.available_permits()
    }

    pub fn queue(&self) -> &TaskQueue<S> {
        &self.queue
    }
}

async fn worker_loop<S, R>(ctx: Arc<ExecContext<S, R>>, worker_id: usize)
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    ctx.reporter.report(SchedulerEvent::WorkerStarted { worker_id });

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Claim an execution slot before popping, so a dequeued task is
        // never stranded waiting for capacity.
        let Ok(permit) = ctx.slots.clone().try_acquire_owned() else {
            tokio::select! {
                () = tokio::time::sleep(ctx.config.busy_backoff) => {}
                () = ctx.cancel.cancelled() => break,
            }
            continue;
        };

        match ctx.queue.dequeue() {
            Some(task_id) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    execute_one(&ctx, task_id).await;
                    drop(permit);
                });
            }
            None => {
                drop(permit);
                if ctx.slots.available_permits() == ctx.config.max_concurrent {
                    maybe_sweep(&ctx).await;
                }
                tokio::select! {
                    () = tokio::time::sleep(ctx.config.poll_interval) => {}
                    () = ctx.cancel.cancelled() => break,
                }
            }
        }
    }

    ctx.reporter.report(SchedulerEvent::WorkerStopped { worker_id });
}

/// Rate-limited batch sweep: when the system is fully idle, re-queue
/// failed tasks that still have retry budget, at high priority.
async fn maybe_sweep<S, R>(ctx: &ExecContext<S, R>)
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    {
        let mut last = ctx.last_sweep.lock().unwrap_or_else(|p| p.into_inner());
        if last.is_some_and(|at| at.elapsed() < ctx.config.sweep_interval) {
            return;
        }
        *last = Some(Instant::now());
    }

    let store = ctx.queue.store();
    let tasks = match store.list_failed_retryable(ctx.config.sweep_limit).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "Batch sweep query failed");
            return;
        }
    };

    let mut requeued = 0;
    for task in tasks {
        if !task.can_retry() {
            continue;
        }
        let reset = match store.reset_for_retry(task.id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Sweep reset failed");
                continue;
            }
        };
        match ctx.queue.enqueue_existing(&reset) {
            Ok(()) => requeued += 1,
            Err(AppError::QueueFull) => {
                tracing::warn!("Queue filled during sweep, stopping early");
                break;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Sweep enqueue failed");
            }
        }
    }

    if requeued > 0 {
        ctx.reporter
            .report(SchedulerEvent::SweepCompleted { requeued });
    }
}

async fn execute_one<S, R>(ctx: &ExecContext<S, R>, task_id: Uuid)
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    let store = ctx.queue.store();
    let task = match store.get(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::warn!(%task_id, "Dequeued task no longer exists");
            return;
        }
        Err(e) => {
            tracing::error!(%task_id, error = %e, "Failed to load dequeued task");
            return;
        }
    };

    // Cancelled (or otherwise moved-on) while sitting in the queue.
    if task.status != TaskStatus::Pending {
        tracing::debug!(%task_id, status = %task.status, "Skipping non-pending task");
        return;
    }

    let Some(handler) = ctx.handlers.get(&task.task_type) else {
        let message = format!("No handler registered for task type '{}'", task.task_type);
        tracing::error!(%task_id, %message);
        if let Err(e) = store
            .update_status(task_id, TaskStatus::Failed, Some(&message))
            .await
        {
            tracing::error!(%task_id, error = %e, "Failed to persist handler-missing failure");
        }
        return;
    };

    ctx.reporter.report(SchedulerEvent::TaskStarted {
        task_id,
        task_type: task.task_type,
    });
    if let Err(e) = store
        .update_status(task_id, TaskStatus::Processing, None)
        .await
    {
        tracing::error!(%task_id, error = %e, "Failed to mark task processing");
        return;
    }

    let started = Instant::now();
    match tokio::time::timeout(ctx.config.task_timeout, handler.run(&task)).await {
        Ok(Ok(())) => {
            if let Err(e) = store
                .update_status(task_id, TaskStatus::Completed, None)
                .await
            {
                tracing::error!(%task_id, error = %e, "Failed to mark task completed");
                return;
            }
            if let Err(e) = store.resolve_errors(task_id, "completed").await {
                tracing::error!(%task_id, error = %e, "Failed to resolve error records");
            }
            ctx.reporter.report(SchedulerEvent::TaskCompleted {
                task_id,
                elapsed: started.elapsed(),
            });
        }
        Ok(Err(error)) => {
            fail_task(ctx, &task, error).await;
        }
        Err(_) => {
            let timeout_secs = ctx.config.task_timeout.as_secs();
            ctx.reporter.report(SchedulerEvent::TaskTimedOut {
                task_id,
                timeout_secs,
            });
            fail_task(ctx, &task, AppError::Timeout(timeout_secs)).await;
        }
    }
}

/// Classify, record and persist a handler failure. `QueueFull` and
/// `ResourceTimeout` are infrastructure outcomes, not task errors, and
/// produce no error record.
async fn fail_task<S, R>(ctx: &ExecContext<S, R>, task: &Task, error: AppError)
where
    S: TaskStore + Send + Sync + 'static,
    R: SchedulerReporter + Clone + 'static,
{
    let store = ctx.queue.store();
    let message = truncate_error(&error.to_string());

    if error.is_task_error() {
        let kind = ctx.policy.classify(&error);
        let detail = serde_json::json!({
            "error": error.to_string(),
            "task_type": task.task_type.as_str(),
            "retry_count": task.retry_count,
        });
        if let Err(e) = store
            .upsert_unresolved_error(Some(task.id), kind, &message, detail)
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "Failed to record task error");
        }
        ctx.reporter.report(SchedulerEvent::TaskFailed {
            task_id: task.id,
            kind,
            error: &message,
        });
    } else {
        tracing::warn!(task_id = %task.id, error = %message, "Task hit infrastructure limit");
    }

    if let Err(e) = store
        .update_status(task.id, TaskStatus::Failed, Some(&message))
        .await
    {
        tracing::error!(task_id = %task.id, error = %e, "Failed to mark task failed");
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::queue::QueueConfig;
    use crate::task::{CreateTaskRequest, TaskPriority};
    use crate::testutil::{MemoryTaskStore, RecordingReporter, make_request};

    struct OkHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn run(&self, _task: &Task) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailHandler {
        error: fn() -> AppError,
    }

    #[async_trait]
    impl TaskHandler for FailHandler {
        async fn run(&self, _task: &Task) -> Result<(), AppError> {
            Err((self.error)())
        }
    }

    struct SlowHandler {
        duration: Duration,
        peak: Arc<AtomicUsize>,
        current: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn run(&self, _task: &Task) -> Result<(), AppError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_num_workers(1)
            .with_poll_interval(Duration::from_millis(10))
            .with_sweep_interval(Duration::ZERO)
            .with_task_timeout(Duration::from_secs(5))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: 0.0,
            backoff_max: Duration::from_millis(1),
        }
    }

    async fn wait_for_status(store: &MemoryTaskStore, task_id: Uuid, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = store.get(task_id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached {status}");
    }

    #[tokio::test]
    async fn test_successful_task_completes_and_resolves_errors() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = RecordingReporter::new();

        let mut scheduler =
            Scheduler::with_reporter(queue.clone(), fast_policy(), fast_config(), reporter.clone());
        scheduler.register_handler(
            TaskType::KeywordSearch,
            Arc::new(OkHandler {
                calls: calls.clone(),
            }),
        );

        let task = queue.add(make_request(TaskType::KeywordSearch)).await.unwrap();
        // Pre-existing unresolved record gets resolved on success.
        store
            .upsert_unresolved_error(Some(task.id), ErrorKind::Timeout, "earlier", serde_json::json!({}))
            .await
            .unwrap();

        scheduler.start();
        let done = wait_for_status(&store, task.id, TaskStatus::Completed).await;
        scheduler.stop(true).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(done.completed_at.is_some());
        assert_eq!(store.unresolved_error_count(), 0);
        let events = reporter.labels();
        assert!(events.contains(&"task_started".to_string()));
        assert!(events.contains(&"task_completed".to_string()));
    }

    #[tokio::test]
    async fn test_handler_error_records_and_fails_without_requeue() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let reporter = RecordingReporter::new();

        // Long sweep interval so the failed task is not swept back in.
        let config = fast_config().with_sweep_interval(Duration::from_secs(60));
        let mut scheduler =
            Scheduler::with_reporter(queue.clone(), fast_policy(), config, reporter.clone());
        scheduler.register_handler(
            TaskType::ProductCrawl,
            Arc::new(FailHandler {
                error: || AppError::Captcha("slider verification detected".into()),
            }),
        );

        let task = queue.add(make_request(TaskType::ProductCrawl)).await.unwrap();
        scheduler.start();
        let failed = wait_for_status(&store, task.id, TaskStatus::Failed).await;
        scheduler.stop(true).await;

        assert!(failed.error_message.unwrap().contains("slider"));
        assert_eq!(store.unresolved_error_count(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_immediately_without_record() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let config = fast_config().with_sweep_interval(Duration::from_secs(60));
        let scheduler = Scheduler::new(queue.clone(), fast_policy(), config);

        let task = queue.add(make_request(TaskType::MonitorCrawl)).await.unwrap();
        scheduler.start();
        let failed = wait_for_status(&store, task.id, TaskStatus::Failed).await;
        scheduler.stop(true).await;

        assert!(failed.error_message.unwrap().contains("No handler registered"));
        assert_eq!(store.unresolved_error_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_abandons_handler_and_classifies_timeout() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let reporter = RecordingReporter::new();

        let config = fast_config()
            .with_sweep_interval(Duration::from_secs(60))
            .with_task_timeout(Duration::from_millis(50));
        let mut scheduler =
            Scheduler::with_reporter(queue.clone(), fast_policy(), config, reporter.clone());
        scheduler.register_handler(
            TaskType::KeywordSearch,
            Arc::new(SlowHandler {
                duration: Duration::from_secs(10),
                peak: Arc::new(AtomicUsize::new(0)),
                current: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let task = queue.add(make_request(TaskType::KeywordSearch)).await.unwrap();
        scheduler.start();
        wait_for_status(&store, task.id, TaskStatus::Failed).await;
        scheduler.stop(true).await;

        assert!(reporter.labels().contains(&"task_timed_out".to_string()));
        assert_eq!(store.unresolved_error_count(), 1);
    }

    #[tokio::test]
    async fn test_max_concurrent_bounds_execution() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let peak = Arc::new(AtomicUsize::new(0));

        let config = fast_config().with_num_workers(3).with_max_concurrent(1);
        let mut scheduler = Scheduler::new(queue.clone(), fast_policy(), config);
        scheduler.register_handler(
            TaskType::KeywordSearch,
            Arc::new(SlowHandler {
                duration: Duration::from_millis(30),
                peak: peak.clone(),
                current: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(queue.add(make_request(TaskType::KeywordSearch)).await.unwrap().id);
        }
        scheduler.start();
        for id in ids {
            wait_for_status(&store, id, TaskStatus::Completed).await;
        }
        scheduler.stop(true).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_sweep_requeues_failed_tasks() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = RecordingReporter::new();

        let mut scheduler =
            Scheduler::with_reporter(queue.clone(), fast_policy(), fast_config(), reporter.clone());
        scheduler.register_handler(
            TaskType::ProductCrawl,
            Arc::new(OkHandler {
                calls: calls.clone(),
            }),
        );

        // A failed task with budget left, seeded directly in the store.
        let task = store.insert(make_request(TaskType::ProductCrawl)).await.unwrap();
        store
            .update_status(task.id, TaskStatus::Failed, Some("connection refused"))
            .await
            .unwrap();

        scheduler.start();
        let done = wait_for_status(&store, task.id, TaskStatus::Completed).await;
        scheduler.stop(true).await;

        assert_eq!(done.retry_count, 1);
        assert!(reporter.labels().contains(&"sweep_completed".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_skips_exhausted_tasks() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(queue.clone(), fast_policy(), fast_config());
        scheduler.register_handler(
            TaskType::ProductCrawl,
            Arc::new(OkHandler {
                calls: calls.clone(),
            }),
        );

        let task = store
            .insert(make_request(TaskType::ProductCrawl).with_max_retries(0))
            .await
            .unwrap();
        store
            .update_status(task.id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop(true).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let still = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(still.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_task_fails_closed() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let scheduler = Scheduler::new(queue.clone(), fast_policy(), fast_config());

        let owner = Uuid::new_v4();
        let request = CreateTaskRequest::new(
            TaskType::ProductCrawl,
            owner,
            serde_json::json!({"product_id": "p1"}),
        )
        .with_max_retries(1);
        let task = store.insert(request).await.unwrap();
        store
            .update_status(task.id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();

        // Non-owner.
        assert!(!scheduler.retry_task(task.id, Uuid::new_v4()).await);
        // Owner, failed state, budget available: allowed.
        assert!(scheduler.retry_task(task.id, owner).await);
        let reset = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.retry_count, 1);
        assert_eq!(reset.priority, TaskPriority::High);

        // Not failed any more.
        assert!(!scheduler.retry_task(task.id, owner).await);

        // Budget spent.
        store
            .update_status(task.id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(!scheduler.retry_task(task.id, owner).await);
    }

    #[tokio::test]
    async fn test_cancel_task_pending_only_and_skipped_by_worker() {
        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let config = fast_config().with_sweep_interval(Duration::from_secs(60));
        let mut scheduler = Scheduler::new(queue.clone(), fast_policy(), config);
        scheduler.register_handler(
            TaskType::KeywordSearch,
            Arc::new(OkHandler {
                calls: calls.clone(),
            }),
        );

        let owner = Uuid::new_v4();
        let request = CreateTaskRequest::new(
            TaskType::KeywordSearch,
            owner,
            serde_json::json!({"keyword": "laptop"}),
        );
        let task = queue.add(request).await.unwrap();

        assert!(!scheduler.cancel_task(task.id, Uuid::new_v4()).await);
        assert!(scheduler.cancel_task(task.id, owner).await);

        // The queued entry is skipped, not executed.
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop(true).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let cancelled = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        // Cancelled is terminal.
        assert!(!scheduler.cancel_task(task.id, owner).await);
    }

    struct CrawlHandler {
        store: MemoryTaskStore,
        pool: Arc<crate::resource::ResourcePool<crate::testutil::MockProvider>>,
        ranking: Arc<crate::rank::RankingService<crate::testutil::MockListingFetcher>>,
        ranks: Arc<StdMutex<Vec<u32>>>,
    }

    #[async_trait]
    impl TaskHandler for CrawlHandler {
        async fn run(&self, task: &Task) -> Result<(), AppError> {
            let lease = self.pool.acquire(Duration::from_secs(2)).await?;
            self.store.set_progress(task.id, 50).await?;
            let product_id = task.payload["product_id"]
                .as_str()
                .ok_or_else(|| AppError::Generic("missing product_id".into()))?;
            let rank = self
                .ranking
                .rank_of("https://shop.example/search?q=mouse", product_id)
                .await?;
            self.ranks.lock().unwrap_or_else(|p| p.into_inner()).push(rank);
            self.store.set_progress(task.id, 100).await?;
            self.pool.release(lease).await;
            Ok(())
        }
    }

    // Whole pipeline: queue -> worker -> handler using the window pool
    // and the single-flight ranking cache.
    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        use crate::rank::{ListingItem, RankConfig, RankingService};
        use crate::resource::{PoolConfig, ResourcePool};
        use crate::testutil::{MockListingFetcher, MockProvider};

        let store = MemoryTaskStore::new();
        let queue = Arc::new(TaskQueue::new(store.clone(), QueueConfig::default()));
        let pool = Arc::new(ResourcePool::new(
            MockProvider::healthy(),
            vec!["w0".into(), "w1".into()],
            PoolConfig::default(),
        ));
        let fetcher = MockListingFetcher::with_pages(vec![vec![
            ListingItem {
                product_id: "p1".into(),
                sponsored: false,
            },
            ListingItem {
                product_id: "p2".into(),
                sponsored: false,
            },
        ]])
        .with_fetch_delay(Duration::from_millis(10));
        let ranking = Arc::new(RankingService::new(fetcher.clone(), RankConfig::default()));
        let ranks = Arc::new(StdMutex::new(Vec::new()));

        let config = fast_config().with_num_workers(2).with_max_concurrent(4);
        let mut scheduler = Scheduler::new(queue.clone(), fast_policy(), config);
        scheduler.register_handler(
            TaskType::ProductCrawl,
            Arc::new(CrawlHandler {
                store: store.clone(),
                pool: pool.clone(),
                ranking,
                ranks: ranks.clone(),
            }),
        );

        let owner = Uuid::new_v4();
        let mut ids = Vec::new();
        for product in ["p1", "p2", "p1", "absent"] {
            let request = CreateTaskRequest::new(
                TaskType::ProductCrawl,
                owner,
                serde_json::json!({"product_id": product}),
            );
            ids.push(queue.add(request).await.unwrap().id);
        }

        scheduler.start();
        for id in &ids {
            let done = wait_for_status(&store, *id, TaskStatus::Completed).await;
            assert_eq!(done.progress, 100);
        }
        scheduler.stop(true).await;

        let mut ranks = ranks.lock().unwrap().clone();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 1, 2, 200]);
        // All four tasks shared one listing scan.
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
        // Every lease came back.
        assert_eq!(pool.idle_count().await, 2);
        assert_eq!(store.unresolved_error_count(), 0);
    }

    #[test]
    fn test_truncate_error_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_error(&long).chars().count(), 500);
        assert_eq!(truncate_error("short"), "short");
    }
}
