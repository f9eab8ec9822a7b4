//! Redis-backed store shared by every process pointed at the same server.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{Store, StoredWindow};
use crate::error::{LimiterError, Result};
use crate::ratelimit::BucketedWindow;

/// Deletes the lock only while it still holds the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A store that keeps window state as JSON strings in Redis.
///
/// Locks are plain keys set with `NX` and a millisecond expiry, so a holder
/// that dies releases its lock after the lock timeout.
pub struct RedisStore {
    connection: MultiplexedConnection,
    lock_timeout: Duration,
    unlock: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, lock_timeout: Duration) -> Result<Self> {
        if url.is_empty() {
            return Err(LimiterError::Config("redis_url is required".to_string()));
        }

        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(lock_timeout_ms = lock_timeout.as_millis() as u64, "Connected to Redis store");

        Ok(Self {
            connection,
            lock_timeout,
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{}", key)
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn try_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(Self::lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(self.lock_timeout))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .unlock
            .key(Self::lock_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            debug!(key = %key, "Unlock ignored for stale token");
        }
        Ok(())
    }

    async fn load(&self, storage_key: &str) -> Result<Option<StoredWindow>> {
        let mut conn = self.connection.clone();
        let (payload, pttl): (Option<String>, i64) = ::redis::pipe()
            .cmd("GET")
            .arg(storage_key)
            .cmd("PTTL")
            .arg(storage_key)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let window: BucketedWindow = serde_json::from_str(&payload)?;
        // PTTL is negative when the key has no expiry.
        let expires_at = (pttl > 0).then(|| Utc::now() + chrono::Duration::milliseconds(pttl));
        Ok(Some(StoredWindow { window, expires_at }))
    }

    async fn save(&self, storage_key: &str, window: &BucketedWindow, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let payload = serde_json::to_string(window)?;
        let _: () = ::redis::cmd("SET")
            .arg(storage_key)
            .arg(payload)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
