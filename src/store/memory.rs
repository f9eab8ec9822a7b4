//! In-process store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{Store, StoredWindow};
use crate::error::Result;
use crate::ratelimit::BucketedWindow;

/// Source of the current time for expiry decisions.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Default time a lock is held before another token may take it over.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of saves between sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 256;

struct StoredEntry {
    window: BucketedWindow,
    expires_at: DateTime<Utc>,
}

struct LockEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// A store that keeps window state and locks in process memory.
///
/// Useful for a single process with many concurrent callers, and as the
/// reference backend in tests. Expired entries are dropped lazily on read,
/// and every `purge_interval` saves the whole store is swept.
pub struct MemoryStore {
    windows: DashMap<String, StoredEntry>,
    locks: DashMap<String, LockEntry>,
    lock_timeout: Duration,
    clock: Clock,
    purge_interval: u64,
    saves: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the wall clock.
    pub fn new(lock_timeout: Duration) -> Self {
        Self::with_clock(lock_timeout, Arc::new(Utc::now))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(lock_timeout: Duration, clock: Clock) -> Self {
        Self {
            windows: DashMap::new(),
            locks: DashMap::new(),
            lock_timeout,
            clock,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            saves: AtomicU64::new(0),
        }
    }

    /// Sweep expired entries every `saves` saves. Zero disables sweeping.
    pub fn with_purge_interval(mut self, saves: u64) -> Self {
        self.purge_interval = saves;
        self
    }

    /// Drop every expired window and lock. Returns the number of windows removed.
    pub fn purge_expired(&self) -> usize {
        let now = (self.clock)();
        let before = self.windows.len();
        self.windows.retain(|_, entry| entry.expires_at > now);
        self.locks.retain(|_, lock| lock.expires_at > now);
        let removed = before.saturating_sub(self.windows.len());
        debug!(removed = removed, "Purged expired windows");
        removed
    }

    /// Number of stored windows, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are stored.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn try_lock(&self, key: &str, token: &str) -> Result<bool> {
        let now = (self.clock)();
        let lock = LockEntry {
            token: token.to_string(),
            expires_at: deadline(now, self.lock_timeout),
        };

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(lock);
                Ok(true)
            }
            Entry::Occupied(mut occupied) if occupied.get().expires_at <= now => {
                debug!(key = %key, "Taking over expired lock");
                occupied.insert(lock);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        if self.locks.remove_if(key, |_, lock| lock.token == token).is_none() {
            trace!(key = %key, "Unlock ignored for stale token");
        }
        Ok(())
    }

    async fn load(&self, storage_key: &str) -> Result<Option<StoredWindow>> {
        let now = (self.clock)();
        if let Some(entry) = self.windows.get(storage_key) {
            if entry.expires_at > now {
                return Ok(Some(StoredWindow {
                    window: entry.window.clone(),
                    expires_at: Some(entry.expires_at),
                }));
            }
        }

        self.windows.remove_if(storage_key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn save(&self, storage_key: &str, window: &BucketedWindow, ttl: Duration) -> Result<()> {
        let now = (self.clock)();
        let expires_at = deadline(now, ttl);
        self.windows.insert(
            storage_key.to_string(),
            StoredEntry {
                window: window.clone(),
                expires_at,
            },
        );

        let saves = self.saves.fetch_add(1, Ordering::Relaxed) + 1;
        if self.purge_interval > 0 && saves % self.purge_interval == 0 {
            self.purge_expired();
        }
        Ok(())
    }
}
