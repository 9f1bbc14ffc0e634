use std::time::Duration;

use shelfwatch_core::{AppError, PoolConfig, QueueConfig, SchedulerConfig};

/// Connection settings for the PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Runtime configuration for one pipeline process: database connection
/// plus the orchestration knobs a deployment actually tunes (queue
/// capacity, worker count, window pool sizing). Everything except
/// `DATABASE_URL` has a default, so a bare environment still boots.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue_capacity: usize,
    pub num_workers: usize,
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: u64,
    /// Window handles this process may lease, comma-separated in the env.
    pub window_ids: Vec<String>,
    pub max_tasks_per_window: u32,
}

impl AppConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (default 5)
    /// - `QUEUE_CAPACITY` (default 1000)
    /// - `SCHEDULER_WORKERS` (default 3)
    /// - `SCHEDULER_MAX_CONCURRENT` (default 10)
    /// - `SCHEDULER_TASK_TIMEOUT_SECS` (default 600)
    /// - `WINDOW_IDS` (comma-separated, default empty)
    /// - `WINDOW_MAX_TASKS` (default 5)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let url = get("DATABASE_URL").ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;
        let max_connections = parse_or(&get, "DATABASE_MAX_CONNECTIONS", 5)?;
        if max_connections == 0 {
            return Err(AppError::ConfigError(
                "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }

        let queue_capacity = parse_or(&get, "QUEUE_CAPACITY", QueueConfig::default().capacity)?;
        let scheduler = SchedulerConfig::default();
        let num_workers = parse_or(&get, "SCHEDULER_WORKERS", scheduler.num_workers)?;
        let max_concurrent_tasks =
            parse_or(&get, "SCHEDULER_MAX_CONCURRENT", scheduler.max_concurrent)?;
        let task_timeout_secs = parse_or(
            &get,
            "SCHEDULER_TASK_TIMEOUT_SECS",
            scheduler.task_timeout.as_secs(),
        )?;
        if num_workers == 0 || max_concurrent_tasks == 0 {
            return Err(AppError::ConfigError(
                "SCHEDULER_WORKERS and SCHEDULER_MAX_CONCURRENT must be at least 1".into(),
            ));
        }

        let window_ids = get("WINDOW_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let max_tasks_per_window = parse_or(
            &get,
            "WINDOW_MAX_TASKS",
            PoolConfig::default().max_tasks_per_handle,
        )?;

        Ok(Self {
            database: DatabaseConfig {
                url,
                max_connections,
            },
            queue_capacity,
            num_workers,
            max_concurrent_tasks,
            task_timeout_secs,
            window_ids,
            max_tasks_per_window,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_num_workers(self.num_workers)
            .with_max_concurrent(self.max_concurrent_tasks)
            .with_task_timeout(Duration::from_secs(self.task_timeout_secs))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default().with_max_tasks_per_handle(self.max_tasks_per_window)
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
        }),
    }
}
