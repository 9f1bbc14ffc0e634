use thiserror::Error;

/// Application-wide error types for shelfwatch.
#[derive(Error, Debug)]
pub enum AppError {
    /// An operation (page load, navigation, protocol call) timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Network-level failure: refused connection, DNS, empty response.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport dropped mid-flight (browser/CDP disconnect).
    #[error("Disconnected: {0}")]
    Disconnect(String),

    /// Anti-bot challenge detected on the target page.
    #[error("Captcha challenge: {0}")]
    Captcha(String),

    /// The in-memory task queue is at capacity. The task row stays
    /// persisted as pending and can be resumed later.
    #[error("Task queue is full")]
    QueueFull,

    /// No exclusive window freed up within the caller's deadline.
    #[error("No window available after {0} seconds")]
    ResourceTimeout(u64),

    /// The window-farm backend rejected or failed an open/close call.
    #[error("Window provider error: {0}")]
    Provider(String),

    /// A task handler reported a domain-level failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration problem (bad env var, missing setting).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error describes a task failure that should be
    /// classified and recorded against the task.
    ///
    /// `QueueFull` and `ResourceTimeout` are synchronous outcomes reported
    /// to the caller of `add`/`acquire`; they never produce error records.
    pub fn is_task_error(&self) -> bool {
        !matches!(
            self,
            AppError::QueueFull | AppError::ResourceTimeout(_) | AppError::ConfigError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_pool_outcomes_are_not_task_errors() {
        assert!(!AppError::QueueFull.is_task_error());
        assert!(!AppError::ResourceTimeout(120).is_task_error());
        assert!(AppError::Timeout(30).is_task_error());
        assert!(AppError::Captcha("challenge page".into()).is_task_error());
        assert!(AppError::Handler("selector drift".into()).is_task_error());
    }
}
