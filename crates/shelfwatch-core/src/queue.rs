//! Bounded in-memory priority queue bound to a [`TaskStore`].
//!
//! Dequeue order is priority rank ascending (high=1 first), then FIFO by
//! creation time. The queue only holds task ids; the store owns the rows,
//! which is what makes startup resume possible after a crash.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::AppError;
use crate::store::TaskStore;
use crate::task::{CreateTaskRequest, Task, TaskStatus};

/// Configuration for the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued (not yet dequeued) tasks.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Heap entry ordered by (priority rank, created_at, enqueue sequence).
///
/// The sequence number breaks created_at ties so FIFO holds even when two
/// tasks share a timestamp.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    rank: u8,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    /// Ids currently sitting in the heap, for duplicate suppression.
    queued: HashSet<Uuid>,
}

/// Priority task queue with persistence and resume capability.
pub struct TaskQueue<S: TaskStore> {
    store: S,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
    seq: AtomicU64,
}

impl<S: TaskStore> TaskQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self {
            store,
            capacity: config.capacity,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a new task and enqueue it.
    ///
    /// On `QueueFull` the row stays persisted as `Pending` (with an
    /// explanatory message) so a later [`resume`](Self::resume) can pick
    /// it up; the error is reported synchronously to the producer.
    pub async fn add(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let task = self.store.insert(request).await?;

        if let Err(e) = self.try_enqueue(&task) {
            if let Err(store_err) = self
                .store
                .update_status(task.id, TaskStatus::Pending, Some("Queue is full"))
                .await
            {
                tracing::warn!(task_id = %task.id, error = %store_err, "Failed to note queue-full state");
            }
            return Err(e);
        }

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task queued"
        );
        Ok(task)
    }

    /// Enqueue an already-persisted task (resume, sweep, manual retry).
    /// A task already sitting in the queue is left alone.
    pub fn enqueue_existing(&self, task: &Task) -> Result<(), AppError> {
        self.try_enqueue(task)
    }

    fn try_enqueue(&self, task: &Task) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.queued.contains(&task.id) {
            return Ok(());
        }
        if inner.heap.len() >= self.capacity {
            return Err(AppError::QueueFull);
        }
        inner.queued.insert(task.id);
        inner.heap.push(Reverse(QueueEntry {
            rank: task.priority.rank(),
            created_at: task.created_at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task_id: task.id,
        }));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority task id, or `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.0.task_id);
        Some(entry.0.task_id)
    }

    /// Blocking pop: waits up to `timeout` for a task to arrive.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<Uuid> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task_id) = self.dequeue() {
                return Some(task_id);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.dequeue();
            }
        }
    }

    /// Re-enqueue pending tasks from the store after a restart.
    ///
    /// Tasks are loaded ordered by (priority, created_at) and enqueued up
    /// to capacity. Idempotent: ids already in the queue are skipped, so
    /// calling it twice doesn't double-book work.
    pub async fn resume(&self) -> Result<usize, AppError> {
        let tasks = self.store.load_resumable().await?;
        let mut resumed = 0usize;
        for task in &tasks {
            let already_queued = {
                let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.queued.contains(&task.id)
            };
            if already_queued {
                continue;
            }
            match self.try_enqueue(task) {
                Ok(()) => resumed += 1,
                Err(AppError::QueueFull) => break,
                Err(e) => return Err(e),
            }
        }
        if resumed > 0 {
            tracing::info!(count = resumed, "Resumed pending tasks from store");
        }
        Ok(resumed)
    }

    /// Persist a status change through the bound store.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        self.store.update_status(task_id, status, error_message).await
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .heap
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
