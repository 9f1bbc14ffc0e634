//! Exclusive window/proxy pool with rotation and restart cooldown.
//!
//! Each handle is granted to exactly one holder at a time. After a handle
//! has served `max_tasks_per_handle` tasks its underlying connection is
//! closed and reopened so every window periodically starts from a clean
//! session. Repeated restart failures push a handle into a cooldown
//! instead of discarding it permanently.
//!
//! # Handle lifecycle
//!
//! ```text
//! FREE --[acquire: probe/open ok]--> IN USE --[release]--> FREE
//!                                        |
//!                                        +--[task count hits limit]--> rotate (close+open)
//!
//! restart failures x N --> COOLDOWN (12 x delay) --> counter reset, FREE
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::error::AppError;

/// Errors surfaced by the window-farm backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The backend is still tearing the window down; retry shortly.
    /// Treated as transient: it triggers a short cooldown and does not
    /// count against the handle's restart budget.
    #[error("Window is closing, try again shortly: {0}")]
    ClosingInProgress(String),

    /// Any other open/close failure.
    #[error("{0}")]
    Failed(String),
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        AppError::Provider(e.to_string())
    }
}

/// Backend that owns the actual browser windows / proxies.
///
/// Calls are fallible remote operations; the pool propagates failures as
/// restart outcomes rather than retrying internally.
pub trait ResourceProvider: Send + Sync {
    /// Open the window and return an opaque connection reference
    /// (e.g. a CDP WebSocket URL).
    fn open(&self, handle_id: &str)
    -> impl Future<Output = Result<String, ProviderError>> + Send;

    fn close(&self, handle_id: &str) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Lightweight reachability check for a cached connection reference.
    fn probe(&self, conn_ref: &str) -> impl Future<Output = bool> + Send;
}

/// Configuration for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Completed tasks before a handle's connection is rotated.
    pub max_tasks_per_handle: u32,
    /// Minimum interval between restarts of the same handle.
    pub restart_delay: Duration,
    /// Restart failures tolerated before the handle enters cooldown.
    pub max_restart_count: u32,
    /// Cooldown = restart_delay x this for transient closing-in-progress.
    pub short_cooldown_factor: u32,
    /// Cooldown = restart_delay x this when the restart budget is spent.
    pub long_cooldown_factor: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_handle: 5,
            restart_delay: Duration::from_secs(5),
            max_restart_count: 10,
            short_cooldown_factor: 2,
            long_cooldown_factor: 12,
        }
    }
}

impl PoolConfig {
    pub fn with_max_tasks_per_handle(mut self, n: u32) -> Self {
        self.max_tasks_per_handle = n;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_max_restart_count(mut self, n: u32) -> Self {
        self.max_restart_count = n;
        self
    }

    fn short_cooldown(&self) -> Duration {
        self.restart_delay * self.short_cooldown_factor
    }

    fn long_cooldown(&self) -> Duration {
        self.restart_delay * self.long_cooldown_factor
    }
}

/// Outcome of an explicit [`ResourcePool::restart`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// Too close to the previous restart; silently skipped.
    SkippedRecentRestart,
    /// The handle is cooling down; skipped.
    CoolingDown,
    /// Backend reported closing-in-progress: short cooldown, not counted.
    TransientBusy,
    /// Structural open failure, counted against the restart budget.
    Failed,
    /// The restart budget is spent: long cooldown entered, counter reset.
    CooldownEntered,
}

#[derive(Debug)]
struct HandleState {
    id: String,
    conn: Option<String>,
    in_use: bool,
    restart_count: u32,
    last_restart_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    tasks_since_rotation: u32,
}

impl HandleState {
    fn new(id: String) -> Self {
        Self {
            id,
            conn: None,
            in_use: false,
            restart_count: 0,
            last_restart_at: None,
            cooldown_until: None,
            tasks_since_rotation: 0,
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Snapshot of a handle's state for monitoring.
#[derive(Debug, Clone)]
pub struct HandleStats {
    pub id: String,
    pub in_use: bool,
    pub has_connection: bool,
    pub restart_count: u32,
    pub tasks_since_rotation: u32,
    pub cooling_down: bool,
}

// Shared between the pool and outstanding leases so a lease dropped
// without an explicit release (abandoned handler, panic) still frees its
// handle on the next pool scan.
#[derive(Debug, Default)]
struct ReclaimShared {
    orphaned: StdMutex<Vec<String>>,
    freed: Notify,
}

/// Exclusive lease on one window for the duration of one task.
///
/// Hand it back via [`ResourcePool::release`] when done; a lease that is
/// simply dropped (handler timed out or panicked) is reclaimed by the
/// pool on its next scan.
#[derive(Debug)]
pub struct WindowLease {
    handle_id: String,
    conn: String,
    shared: Option<Arc<ReclaimShared>>,
}

impl WindowLease {
    pub fn handle_id(&self) -> &str {
        &self.handle_id
    }

    /// Opaque connection reference for the leased window.
    pub fn conn(&self) -> &str {
        &self.conn
    }
}

impl Drop for WindowLease {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let handle_id = std::mem::take(&mut self.handle_id);
            tracing::warn!(%handle_id, "Window lease dropped without release, queueing reclaim");
            shared
                .orphaned
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(handle_id);
            shared.freed.notify_one();
        }
    }
}

/// Pool of exclusive window handles.
pub struct ResourcePool<P: ResourceProvider> {
    provider: P,
    config: PoolConfig,
    inner: Mutex<Vec<HandleState>>,
    shared: Arc<ReclaimShared>,
}

impl<P: ResourceProvider> ResourcePool<P> {
    pub fn new(provider: P, handle_ids: Vec<String>, config: PoolConfig) -> Self {
        if handle_ids.is_empty() {
            tracing::warn!("Resource pool constructed with no handles");
        }
        Self {
            provider,
            config,
            inner: Mutex::new(handle_ids.into_iter().map(HandleState::new).collect()),
            shared: Arc::new(ReclaimShared::default()),
        }
    }

    /// Acquire an exclusive window, blocking until one frees up or
    /// `timeout` elapses.
    ///
    /// Handles in cooldown or with unreachable connections are skipped;
    /// stale cached connections are discarded and reopened lazily. The
    /// pool lock is never held across a provider call: a candidate is
    /// reserved under the lock, then probed/opened with the lock
    /// released, so one slow window-farm call cannot stall the rest of
    /// the pool.
    pub async fn acquire(&self, timeout: Duration) -> Result<WindowLease, AppError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut attempted: Vec<String> = Vec::new();
            loop {
                let (reserved, to_close) = {
                    let mut inner = self.inner.lock().await;
                    let to_close = self.reclaim_orphans(&mut inner);
                    let now = Instant::now();
                    let reserved = inner
                        .iter_mut()
                        .find(|s| {
                            !s.in_use
                                && !s.cooling_down(now)
                                && !attempted.iter().any(|id| *id == s.id)
                        })
                        .map(|state| {
                            state.in_use = true;
                            (state.id.clone(), state.conn.clone())
                        });
                    (reserved, to_close)
                };
                self.close_rotated(to_close).await;

                let Some((handle_id, cached)) = reserved else {
                    break;
                };
                attempted.push(handle_id.clone());

                if let Some(conn) = self.connect_reserved(&handle_id, cached).await {
                    tracing::debug!(%handle_id, "Window leased");
                    return Ok(WindowLease {
                        handle_id,
                        conn,
                        shared: Some(self.shared.clone()),
                    });
                }

                // Open failed; free the reservation and try another handle.
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) {
                    state.in_use = false;
                    state.conn = None;
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for a free window"
                );
                return Err(AppError::ResourceTimeout(timeout.as_secs()));
            };
            // Re-scan periodically even without a release, so cooldown
            // expiry is noticed.
            let _ = tokio::time::timeout(
                remaining.min(Duration::from_secs(10)),
                self.shared.freed.notified(),
            )
            .await;
        }
    }

    /// Validate or (re)establish the connection for a handle already
    /// marked in use, without holding the pool lock across the provider
    /// call. Returns `None` if the handle is unusable right now.
    async fn connect_reserved(&self, handle_id: &str, cached: Option<String>) -> Option<String> {
        if let Some(conn) = cached {
            if self.provider.probe(&conn).await {
                return Some(conn);
            }
            tracing::warn!(
                handle_id,
                stale_conn = %conn,
                "Cached connection unreachable, reopening"
            );
        }

        match self.provider.open(handle_id).await {
            Ok(conn) => {
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) {
                    state.conn = Some(conn.clone());
                }
                Some(conn)
            }
            Err(e) => {
                tracing::error!(handle_id, error = %e, "Failed to open window");
                None
            }
        }
    }

    /// Return a lease. Rotates the connection once the handle has served
    /// `max_tasks_per_handle` tasks, so it comes back with a clean
    /// session. A failed reopen leaves the handle connection-less; the
    /// next acquire re-establishes it lazily.
    pub async fn release(&self, mut lease: WindowLease) {
        lease.shared = None;
        let handle_id = std::mem::take(&mut lease.handle_id);
        drop(lease);

        let rotate = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) else {
                tracing::warn!(%handle_id, "Released lease for unknown handle");
                return;
            };
            state.tasks_since_rotation += 1;
            tracing::debug!(
                %handle_id,
                task_count = state.tasks_since_rotation,
                "Window released"
            );
            if state.tasks_since_rotation >= self.config.max_tasks_per_handle {
                // Keep the handle marked in use while the rotation runs
                // outside the lock.
                state.tasks_since_rotation = 0;
                state.conn = None;
                true
            } else {
                state.in_use = false;
                false
            }
        };

        if rotate {
            tracing::info!(%handle_id, "Task limit reached, rotating window");
            if let Err(e) = self.provider.close(&handle_id).await {
                tracing::warn!(%handle_id, error = %e, "Close during rotation failed");
            }
            let conn = match self.provider.open(&handle_id).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(
                        %handle_id,
                        error = %e,
                        "Reopen after rotation failed, will reopen lazily"
                    );
                    None
                }
            };
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) {
                state.conn = conn;
                state.in_use = false;
            }
        }

        self.shared.freed.notify_one();
    }

    /// Free handles whose leases were dropped without an explicit release.
    ///
    /// Called with the pool lock held, so it never talks to the provider:
    /// a reclaimed handle due for rotation just sheds its connection here
    /// and the returned ids get a best-effort close from the caller once
    /// the lock is released. The reopen happens lazily on next acquire.
    fn reclaim_orphans(&self, inner: &mut Vec<HandleState>) -> Vec<String> {
        let orphaned: Vec<String> = {
            let mut orphaned = self
                .shared
                .orphaned
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *orphaned)
        };

        let mut to_close = Vec::new();
        for handle_id in orphaned {
            let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) else {
                tracing::warn!(%handle_id, "Reclaimed lease for unknown handle");
                continue;
            };
            state.in_use = false;
            state.tasks_since_rotation += 1;
            if state.tasks_since_rotation >= self.config.max_tasks_per_handle {
                state.tasks_since_rotation = 0;
                state.conn = None;
                to_close.push(handle_id);
            }
        }
        to_close
    }

    async fn close_rotated(&self, handle_ids: Vec<String>) {
        for handle_id in handle_ids {
            tracing::info!(%handle_id, "Task limit reached, rotating window");
            if let Err(e) = self.provider.close(&handle_id).await {
                tracing::warn!(%handle_id, error = %e, "Close during rotation failed");
            }
        }
    }

    /// Failure-triggered restart (e.g. after a captcha challenge).
    ///
    /// Restarts inside the minimum interval are silently skipped. A spent
    /// restart budget pushes the handle into an extended cooldown and
    /// resets the counter so it can be tried again after expiry. A
    /// transient closing-in-progress reply gets only a short cooldown and
    /// doesn't count.
    pub async fn restart(&self, handle_id: &str) -> Result<RestartOutcome, AppError> {
        // Guards run and `last_restart_at` is stamped under the lock, so a
        // concurrent restart of the same handle hits the interval guard
        // while this one talks to the provider lock-free.
        {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) else {
                return Err(AppError::Generic(format!("Unknown handle: {handle_id}")));
            };

            let now = Instant::now();
            if state.cooling_down(now) {
                tracing::debug!(handle_id, "Restart skipped, handle cooling down");
                return Ok(RestartOutcome::CoolingDown);
            }
            if state.restart_count >= self.config.max_restart_count {
                state.cooldown_until = Some(now + self.config.long_cooldown());
                state.restart_count = 0;
                tracing::error!(
                    handle_id,
                    cooldown_secs = self.config.long_cooldown().as_secs(),
                    "Restart budget spent, entering cooldown"
                );
                return Ok(RestartOutcome::CooldownEntered);
            }
            if let Some(last) = state.last_restart_at
                && now.duration_since(last) < self.config.restart_delay
            {
                tracing::debug!(handle_id, "Restarts too close together, skipped");
                return Ok(RestartOutcome::SkippedRecentRestart);
            }
            state.last_restart_at = Some(now);
            state.conn = None;
        }

        if let Err(e) = self.provider.close(handle_id).await {
            tracing::warn!(handle_id, error = %e, "Close before restart failed");
        }
        let opened = self.provider.open(handle_id).await;

        let mut inner = self.inner.lock().await;
        let Some(state) = inner.iter_mut().find(|s| s.id == handle_id) else {
            return Err(AppError::Generic(format!("Unknown handle: {handle_id}")));
        };
        let now = Instant::now();
        match opened {
            Ok(conn) => {
                state.conn = Some(conn);
                state.restart_count += 1;
                tracing::info!(handle_id, "Window restarted");
                Ok(RestartOutcome::Restarted)
            }
            Err(ProviderError::ClosingInProgress(msg)) => {
                state.cooldown_until = Some(now + self.config.short_cooldown());
                tracing::warn!(handle_id, %msg, "Window still closing, short cooldown");
                Ok(RestartOutcome::TransientBusy)
            }
            Err(ProviderError::Failed(msg)) => {
                state.restart_count += 1;
                state.conn = None;
                if state.restart_count >= self.config.max_restart_count {
                    state.cooldown_until = Some(now + self.config.long_cooldown());
                    state.restart_count = 0;
                    tracing::error!(
                        handle_id,
                        %msg,
                        "Repeated restart failures, entering cooldown"
                    );
                    Ok(RestartOutcome::CooldownEntered)
                } else {
                    tracing::error!(
                        handle_id,
                        %msg,
                        count = state.restart_count,
                        "Window restart failed"
                    );
                    Ok(RestartOutcome::Failed)
                }
            }
        }
    }

    pub async fn stats(&self) -> Vec<HandleStats> {
        let (stats, to_close) = {
            let mut inner = self.inner.lock().await;
            let to_close = self.reclaim_orphans(&mut inner);
            let now = Instant::now();
            let stats = inner
                .iter()
                .map(|s| HandleStats {
                    id: s.id.clone(),
                    in_use: s.in_use,
                    has_connection: s.conn.is_some(),
                    restart_count: s.restart_count,
                    tasks_since_rotation: s.tasks_since_rotation,
                    cooling_down: s.cooling_down(now),
                })
                .collect();
            (stats, to_close)
        };
        self.close_rotated(to_close).await;
        stats
    }

    pub async fn idle_count(&self) -> usize {
        let (idle, to_close) = {
            let mut inner = self.inner.lock().await;
            let to_close = self.reclaim_orphans(&mut inner);
            let now = Instant::now();
            let idle = inner
                .iter()
                .filter(|s| !s.in_use && !s.cooling_down(now))
                .count();
            (idle, to_close)
        };
        self.close_rotated(to_close).await;
        idle
    }
}
