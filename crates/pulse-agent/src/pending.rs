//! Correlation table for requests awaiting a reply from the hub
//!
//! Each entry owns a one-shot continuation. Entries leave the table exactly
//! once: on the first matching reply, on cancellation, or on TTL eviction.
//! The table is owned by a single session and dropped with it.

use pulse_core::CorrelationId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

struct PendingEntry<T> {
    created_at: Instant,
    continuation: oneshot::Sender<T>,
}

/// Pending callbacks keyed by correlation id, bounded by a TTL
pub struct PendingCallbacks<T> {
    ttl: Duration,
    entries: Mutex<HashMap<CorrelationId, PendingEntry<T>>>,
}

impl<T> PendingCallbacks<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a continuation under `id` before the request is sent
    ///
    /// Re-registering an id replaces (and drops) the previous continuation.
    pub async fn register(&self, id: CorrelationId) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            created_at: Instant::now(),
            continuation: tx,
        };
        self.entries.lock().await.insert(id, entry);
        rx
    }

    /// Resolve the continuation for `id` with `value`
    ///
    /// Returns `false` when no entry matches (unknown, already resolved or
    /// evicted), which callers treat as a correlation mismatch.
    pub async fn complete(&self, id: &str, value: T) -> bool {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(entry) => {
                if entry.continuation.send(value).is_err() {
                    debug!("Continuation for {} was dropped before completion", id);
                }
                true
            }
            None => false,
        }
    }

    /// Remove `id` without resolving it. Returns whether it was pending.
    pub async fn cancel(&self, id: &str) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    /// Evict entries older than the TTL, returning their ids
    pub async fn evict_expired(&self) -> Vec<CorrelationId> {
        self.evict_expired_at(Instant::now()).await
    }

    /// Evict entries older than the TTL as of `now`
    pub async fn evict_expired_at(&self, now: Instant) -> Vec<CorrelationId> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<CorrelationId> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            entries.remove(id);
            debug!("Evicted pending callback {}", id);
        }

        expired
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
