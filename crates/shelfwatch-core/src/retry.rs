//! Error classification and retry policy.
//!
//! Failures are classified into a coarse [`ErrorKind`] that selects the
//! retry ceiling and the backoff shape. Callers never decide retry
//! eligibility themselves: whether an error is retried is governed solely
//! by [`RetryPolicy::should_retry`].

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::ErrorSink;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Protocol or navigation timeout.
    Timeout,
    /// Network failure: refused connection, DNS, empty response.
    Connection,
    /// Transport dropped mid-flight (browser/CDP disconnect).
    Disconnect,
    /// Anti-bot challenge detected.
    Captcha,
    /// Fallback for everything else.
    Other,
}

impl ErrorKind {
    /// Per-kind retry ceiling. Always further capped by the task's own
    /// `max_retries`.
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorKind::Timeout => 3,
            ErrorKind::Connection => 3,
            ErrorKind::Disconnect => 2,
            ErrorKind::Captcha => 2,
            ErrorKind::Other => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Disconnect => "disconnect",
            ErrorKind::Captcha => "captcha",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timeout" => Ok(ErrorKind::Timeout),
            "connection" => Ok(ErrorKind::Connection),
            "disconnect" => Ok(ErrorKind::Disconnect),
            "captcha" => Ok(ErrorKind::Captcha),
            "other" => Ok(ErrorKind::Other),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

/// Retry policy with exponential backoff and per-kind delay shaping.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Exponential backoff base: delay grows as `base^retry_count` seconds.
    pub backoff_base: f64,
    /// Ceiling on the computed base delay.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: 2.0,
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff_base: f64, backoff_max: Duration) -> Self {
        Self {
            backoff_base,
            backoff_max,
        }
    }

    /// Classify an error into an [`ErrorKind`].
    ///
    /// Typed variants are matched first; string-typed errors (provider,
    /// handler, generic) fall back to message substrings, defaulting to
    /// [`ErrorKind::Other`].
    pub fn classify(&self, error: &AppError) -> ErrorKind {
        match error {
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Connection(_) => ErrorKind::Connection,
            AppError::Disconnect(_) => ErrorKind::Disconnect,
            AppError::Captcha(_) => ErrorKind::Captcha,
            AppError::Provider(msg)
            | AppError::Handler(msg)
            | AppError::DatabaseError(msg)
            | AppError::Generic(msg) => Self::classify_message(msg),
            _ => ErrorKind::Other,
        }
    }

    fn classify_message(msg: &str) -> ErrorKind {
        let msg = msg.to_lowercase();
        if msg.contains("timeout") || msg.contains("timed out") {
            ErrorKind::Timeout
        } else if msg.contains("connection")
            || msg.contains("refused")
            || msg.contains("empty response")
        {
            ErrorKind::Connection
        } else if msg.contains("disconnect") || msg.contains("chunked") {
            ErrorKind::Disconnect
        } else if msg.contains("captcha") || msg.contains("verification") {
            ErrorKind::Captcha
        } else {
            ErrorKind::Other
        }
    }

    /// `retry_count < min(kind_cap, task_max)`. Pass `None` when no
    /// task-level cap applies.
    pub fn should_retry(&self, kind: ErrorKind, retry_count: u32, task_max: Option<u32>) -> bool {
        let cap = match task_max {
            Some(task_max) => kind.max_retries().min(task_max),
            None => kind.max_retries(),
        };
        retry_count < cap
    }

    /// Backoff delay before the next attempt.
    ///
    /// `base = min(backoff_base^retry_count, backoff_max)`, then shaped by
    /// kind: timeouts back off plainly, connection errors slightly longer,
    /// disconnects retry almost immediately, captcha waits long enough for
    /// a window rotation to take effect.
    pub fn delay(&self, kind: ErrorKind, retry_count: u32) -> Duration {
        let base = self
            .backoff_max
            .min(Duration::from_secs_f64(
                self.backoff_base.powi(retry_count as i32),
            ));
        match kind {
            ErrorKind::Timeout | ErrorKind::Other => base,
            ErrorKind::Connection => base.mul_f64(1.5),
            ErrorKind::Disconnect => base.min(Duration::from_secs(2)),
            ErrorKind::Captcha => base.mul_f64(2.0).min(Duration::from_secs(10)),
        }
    }

    /// Run `op`, retrying classified-transient failures with backoff.
    ///
    /// Every failure is classified and recorded against `task_id` through
    /// the sink (the open record is updated in place, never appended).
    /// When the per-kind ceiling is reached the final error is returned to
    /// the caller as fatal.
    pub async fn execute_with_retry<T, F, Fut, S>(
        &self,
        task_id: Option<Uuid>,
        sink: &S,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        S: ErrorSink,
    {
        let mut retry_count: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let kind = self.classify(&error);
                    let detail = serde_json::json!({
                        "attempt": retry_count + 1,
                        "kind": kind.as_str(),
                    });
                    if let Err(sink_err) = sink
                        .upsert_unresolved_error(task_id, kind, &error.to_string(), detail)
                        .await
                    {
                        tracing::error!(error = %sink_err, "Failed to record error");
                    }

                    if !self.should_retry(kind, retry_count, None) {
                        tracing::error!(
                            ?task_id,
                            %kind,
                            retries = retry_count,
                            error = %error,
                            "Giving up after exhausting retries"
                        );
                        return Err(error);
                    }

                    let delay = self.delay(kind, retry_count);
                    retry_count += 1;
                    tracing::warn!(
                        ?task_id,
                        %kind,
                        attempt = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
