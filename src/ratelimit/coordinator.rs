//! Store-coordinated sliding-window rate limiter.
//!
//! A [`RateLimitCoordinator`] turns one limit configuration into decisions for
//! arbitrary caller keys. Every decision runs a lock, load, evaluate, persist,
//! unlock cycle against a shared [`Store`], so any number of tasks and
//! processes can decide for the same key against one store.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::window::BucketedWindow;
use crate::error::{DecisionError, LimiterError, Result};
use crate::store::Store;

/// The outcome of a rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the limit has been reached and the event was not admitted
    pub reached: bool,
    /// Events counted in the window, including this one if it was admitted
    pub count: u64,
}

impl Decision {
    /// The decision used whenever coordination fails.
    pub fn fail_closed() -> Self {
        Self {
            reached: true,
            count: 0,
        }
    }

    /// Whether the event was admitted.
    pub fn is_allowed(&self) -> bool {
        !self.reached
    }
}

/// A sliding-window rate limiter whose state lives in a shared store.
pub struct RateLimitCoordinator {
    /// Window length in whole seconds
    window_secs: u64,
    /// Maximum admitted events per window
    limit: u64,
    /// Length of one bucket in seconds
    bucket_span: u64,
    /// Namespace prepended to caller keys for storage
    prefix: String,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for RateLimitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCoordinator")
            .field("window_secs", &self.window_secs)
            .field("limit", &self.limit)
            .field("bucket_span", &self.bucket_span)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RateLimitCoordinator {
    /// Create a coordinator admitting `limit` events per `window`, aggregated
    /// into roughly `buckets` buckets.
    ///
    /// The window is truncated to whole seconds. Each coordinator gets a
    /// random storage prefix unless one is set with [`Self::with_prefix`].
    pub fn new(window: Duration, limit: u64, buckets: u64, store: Arc<dyn Store>) -> Result<Self> {
        let window_secs = window.as_secs();
        if window_secs == 0 {
            return Err(LimiterError::Config(
                "window must be at least one second".to_string(),
            ));
        }
        if buckets == 0 {
            return Err(LimiterError::Config(
                "number of buckets must be greater than zero".to_string(),
            ));
        }

        let bucket_span = window_secs.div_ceil(buckets).max(1);
        let prefix = random_prefix();

        info!(
            window_secs = window_secs,
            limit = limit,
            bucket_span = bucket_span,
            prefix = %prefix,
            "Rate limit coordinator created"
        );

        Ok(Self {
            window_secs,
            limit,
            bucket_span,
            prefix,
            store,
        })
    }

    /// Use a fixed storage namespace.
    ///
    /// Coordinators in different processes must share a prefix to share state.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        debug!(prefix = %self.prefix, "Coordinator prefix set");
        self
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Maximum admitted events per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bucket length in seconds.
    pub fn bucket_span(&self) -> u64 {
        self.bucket_span
    }

    /// Storage namespace.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decide for `key` using the wall clock.
    pub async fn check(&self, key: &str) -> std::result::Result<Decision, DecisionError> {
        self.decide_at(key, Utc::now()).await
    }

    /// Whether the limit for `key` is reached now.
    pub async fn limit_reached(&self, key: &str) -> std::result::Result<bool, DecisionError> {
        self.limit_reached_at(key, Utc::now()).await
    }

    /// Whether the limit for `key` is reached at `now`.
    pub async fn limit_reached_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, DecisionError> {
        self.decide_at(key, now).await.map(|decision| decision.reached)
    }

    /// Record an event for `key` at `now` unless the limit is reached.
    ///
    /// If the key's lock is held elsewhere the decision is fail-closed
    /// without touching the store. Errors after the lock was taken still
    /// release it, and carry the decision the caller should act on.
    pub async fn decide_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Decision, DecisionError> {
        let token = Uuid::new_v4().to_string();

        match self.store.try_lock(key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Lock contended, failing closed");
                return Ok(Decision::fail_closed());
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to acquire lock, failing closed");
                return Err(DecisionError::new(
                    Decision::fail_closed(),
                    LimiterError::LockUnavailable {
                        key: key.to_string(),
                        source: Box::new(e),
                    },
                ));
            }
        }

        let outcome = self.decide_locked(key, now).await;
        self.release(key, &token).await;
        outcome
    }

    async fn decide_locked(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Decision, DecisionError> {
        let storage_key = self.storage_key(key);

        let stored = self.store.load(&storage_key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to load window");
            DecisionError::new(Decision::fail_closed(), e)
        })?;
        let (mut window, expires_at) = match stored {
            Some(stored) => (stored.window, stored.expires_at),
            None => (BucketedWindow::new(), None),
        };

        let eval = window.evaluate(self.window_secs, self.limit, self.bucket_span, now);
        let decision = Decision {
            reached: eval.reached,
            count: eval.count,
        };

        trace!(
            key = %key,
            reached = eval.reached,
            count = eval.count,
            limit = self.limit,
            "Evaluated window"
        );
        if eval.reached {
            debug!(key = %key, limit = self.limit, "Rate limit reached");
        }

        if eval.changed {
            let ttl = self.persist_ttl(eval.reset_ttl, expires_at, now);
            self.store
                .save(&storage_key, &window, ttl)
                .await
                .map_err(|e| {
                    warn!(key = %key, error = %e, "Failed to save window");
                    DecisionError::new(decision, e)
                })?;
        }

        Ok(decision)
    }

    /// Count events recorded for `key` within the trailing `window`, using the wall clock.
    pub async fn count(&self, key: &str, window: Duration) -> Result<u64> {
        self.count_at(key, window, Utc::now()).await
    }

    /// Count events recorded for `key` within `window` before `now`.
    ///
    /// `window` may not exceed the coordinator's window. Never creates or
    /// modifies stored state.
    pub async fn count_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<u64> {
        let window_secs = window.as_secs();
        if window_secs > self.window_secs {
            return Err(LimiterError::Config(format!(
                "count window of {}s exceeds the configured window of {}s",
                window_secs, self.window_secs
            )));
        }

        let token = Uuid::new_v4().to_string();
        match self.store.try_lock(key, &token).await {
            Ok(true) => {}
            Ok(false) => return Err(LimiterError::LockContended(key.to_string())),
            Err(e) => {
                return Err(LimiterError::LockUnavailable {
                    key: key.to_string(),
                    source: Box::new(e),
                })
            }
        }

        let loaded = self.store.load(&self.storage_key(key)).await;
        self.release(key, &token).await;

        Ok(loaded?
            .map(|stored| stored.window.count(window_secs, now))
            .unwrap_or(0))
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Time-to-live for a persisted window.
    ///
    /// Admissions get a full window. Otherwise the state keeps whatever life
    /// it had left, measured from the evaluated `now`.
    fn persist_ttl(
        &self,
        reset: bool,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let full = Duration::from_secs(self.window_secs);
        match expires_at {
            Some(expires_at) if !reset => {
                let remaining = (expires_at - now).num_seconds().max(1);
                Duration::from_secs(remaining as u64)
            }
            _ => full,
        }
    }

    async fn release(&self, key: &str, token: &str) {
        if let Err(e) = self.store.unlock(key, token).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        }
    }
}

fn random_prefix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{}_{:02}_", nanos, rand::thread_rng().gen_range(0..100))
}
