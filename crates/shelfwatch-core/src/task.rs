use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::ErrorKind;

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Crawl a keyword's search result pages and collect product links.
    KeywordSearch,
    /// Crawl a single product page for full data (price, stock, ranks).
    ProductCrawl,
    /// Lightweight recurring crawl of an already-tracked product.
    MonitorCrawl,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::KeywordSearch => "keyword_search",
            TaskType::ProductCrawl => "product_crawl",
            TaskType::MonitorCrawl => "monitor_crawl",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword_search" => Ok(TaskType::KeywordSearch),
            "product_crawl" => Ok(TaskType::ProductCrawl),
            "monitor_crawl" => Ok(TaskType::MonitorCrawl),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Status of a task in the queue.
///
/// Transitions only along `Pending → Processing → {Completed, Failed}`;
/// `Failed → Pending` happens on retry (manual or batch sweep) and resets
/// the error message while bumping `retry_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Dequeue priority. Lower rank dequeues first; ties break FIFO by
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank used for queue ordering: high=1, normal=2, low=3.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!("Unknown task priority: {}", s)),
        }
    }
}

/// A crawl task.
///
/// Created by producers, mutated only by the scheduler and the explicit
/// retry/cancel API. Rows are never deleted, only status-terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// User who created the task; retry/cancel are ownership-checked.
    pub owner_id: Uuid,
    /// Type-specific parameters (keyword id, product URL, ...).
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    /// 0–100, updated by long-running handlers.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Request to create a new task.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub owner_id: Uuid,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub max_retries: u32,
}

impl CreateTaskRequest {
    pub fn new(task_type: TaskType, owner_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            task_type,
            owner_id,
            priority: TaskPriority::Normal,
            payload,
            max_retries: 5,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }
}

/// Persisted record of a classified task failure.
///
/// At most one unresolved record exists per task: repeated failures update
/// the open record in place instead of appending, so diagnostics stay
/// bounded. The record is resolved explicitly or when the task succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: ErrorKind,
    pub message: String,
    /// Structured diagnostic detail (attempt, URL, window id, ...).
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_action: Option<String>,
}
