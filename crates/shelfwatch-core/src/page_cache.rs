//! Keyed single-flight cache with TTL expiry.
//!
//! Concurrent callers asking for the same key share one load: the first
//! caller runs the loader while the rest wait on a per-key lock and then
//! read the freshly cached value. Different keys never block each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::AppError;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry<V> {
    value: V,
    loaded_at: Instant,
}

/// TTL cache where at most one load per key runs at a time.
pub struct KeyedSingleFlightCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
    // Per-key load locks. Kept separate from the entry map so waiting on
    // a slow load for one key never blocks lookups for other keys.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<V: Clone> Default for KeyedSingleFlightCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<V: Clone> KeyedSingleFlightCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, or run `load` to produce it.
    ///
    /// A failed load caches nothing; the next caller retries.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Result<V, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AppError>>,
    {
        if let Some(value) = self.get_fresh(key) {
            return Ok(value);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(value) = self.get_fresh(key) {
            tracing::debug!(key, "Cache filled while waiting for load lock");
            return Ok(value);
        }

        tracing::debug!(key, "Cache miss, loading");
        let value = load().await?;
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Fresh cached value, if any. Expired entries are evicted on read.
    fn get_fresh(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some(entry) if entry.loaded_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                tracing::debug!(key, "Cache entry expired");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Drop locks nobody holds anymore, otherwise the table grows by
        // one entry per distinct key ever loaded.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }

    pub fn invalidate(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
