//! Remembers the outcome of recent requests by their client-supplied key.
use std::{collections::HashMap, sync::Arc};

use chrono::Duration;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::desk::{Clock, LedgerError, Timestamp};

/// How long a result is remembered by default.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Cache size at which a `put` also sweeps out expired entries.
pub const DEFAULT_CLEANUP_THRESHOLD: usize = 100;

struct Entry<V> {
    value: V,
    stored_at: Timestamp,
}

/// Time-limited map from idempotency key to a previous result.
///
/// Expired entries are treated as absent and dropped when read. Blank keys are never stored.
pub struct IdempotencyCache<V> {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cleanup_threshold: usize,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, cleanup_threshold: usize) -> Self {
        IdempotencyCache {
            clock,
            ttl,
            cleanup_threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Previous result stored under `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        if key.trim().is_empty() {
            return None;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if self.is_live(entry, now) {
            return Some(entry.value.clone());
        }
        entries.remove(key);
        debug!(key, "idempotency entry expired");
        None
    }

    /// Stores `value` under `key`, replacing anything stored before.
    pub fn put(&self, key: &str, value: V) {
        if key.trim().is_empty() {
            return;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: now,
            },
        );
        if entries.len() >= self.cleanup_threshold {
            let before = entries.len();
            entries.retain(|_, entry| self.is_live(entry, now));
            debug!(removed = before - entries.len(), "swept expired idempotency entries");
        }
    }

    /// True if a live result is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Forgets the result stored under `key`.
    pub fn evict(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn is_live(&self, entry: &Entry<V>, now: Timestamp) -> bool {
        now - entry.stored_at < self.ttl
    }
}

/// Checks that a client-supplied idempotency key is a UUID.
pub fn validate_key(key: &str) -> Result<(), LedgerError> {
    Uuid::parse_str(key.trim())
        .map(|_| ())
        .map_err(|_| LedgerError::InvalidIdempotencyKey(key.to_string()))
}
