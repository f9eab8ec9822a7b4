//! Shared storage for window state and per-key locks.
//!
//! A [`Store`] is the only point of coordination between processes. It
//! persists [`BucketedWindow`] state with a time-to-live and offers a
//! non-blocking, token-checked exclusive lock per caller key.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
#[cfg(not(feature = "redis"))]
use crate::error::LimiterError;
use crate::ratelimit::BucketedWindow;

pub use memory::{Clock, MemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Window state as loaded from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredWindow {
    /// The persisted window
    pub window: BucketedWindow,
    /// When the persisted state expires, if the store reports it
    pub expires_at: Option<DateTime<Utc>>,
}

/// Key-value persistence with an exclusive-lock primitive.
///
/// Locks are keyed by the caller key while window state is keyed by the
/// namespaced storage key, so the two live in separate keyspaces.
#[async_trait]
pub trait Store: Send + Sync {
    /// Try to take the lock for `key` without blocking.
    ///
    /// Returns `Ok(false)` when another token currently holds it. Locks are
    /// time-bounded by the store so an abandoned lock is eventually released.
    async fn try_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// Release the lock for `key` if it is still held by `token`.
    ///
    /// A stale token leaves the lock untouched.
    async fn unlock(&self, key: &str, token: &str) -> Result<()>;

    /// Load the window stored under `storage_key`, if present and not expired.
    async fn load(&self, storage_key: &str) -> Result<Option<StoredWindow>>;

    /// Replace the window stored under `storage_key`, expiring after `ttl`.
    async fn save(&self, storage_key: &str, window: &BucketedWindow, ttl: Duration) -> Result<()>;
}

/// Build the store described by the configuration.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let lock_timeout = Duration::from_millis(config.lock_timeout_ms);

    match config.backend {
        StoreBackend::Memory => {
            info!(lock_timeout_ms = config.lock_timeout_ms, "Using in-memory store");
            Ok(Arc::new(MemoryStore::new(lock_timeout)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            let store = RedisStore::connect(url, lock_timeout).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(LimiterError::Config(
            "redis backend requires the `redis` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_store() {
        let config = StoreConfig::default();
        let store = build_store(&config).await.unwrap();

        assert!(store.try_lock("key", "token").await.unwrap());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_build_redis_store_without_feature() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: Some("redis://127.0.0.1/".to_string()),
            ..StoreConfig::default()
        };

        let result = build_store(&config).await;
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }
}
