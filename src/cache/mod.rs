//! Idempotency, lockout, and hot-read cache (spec §4.2, §4.9) — C2, C9
//!
//! A single Redis-backed `Cache` with five primitives (`get`, `set_with_ttl`,
//! `incr`, `expire`, `delete`), grounded on the `bb8-redis` pooling pattern
//! this corpus carries (`reference/axum/examples/tokio-redis`). Three use
//! patterns are layered on top: idempotent response replay, login lockout,
//! and token revocation; a fourth shares the same store for the read-through
//! hot-data cache (C9).
//!
//! **Failure policy** (spec §4.2): if Redis is unreachable, `get` returns
//! `Ok(None)` and logs a warning rather than propagating the error — the
//! caller cannot tell "key absent" from "store down", which is exactly the
//! fail-open behaviour the spec requires.

use std::time::Duration;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis pool error: {0}")]
    Pool(#[from] bb8::RunError<redis::RedisError>),
    #[error("redis command error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Clone)]
pub struct Cache {
    pool: Pool<RedisConnectionManager>,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = Pool::builder().build(manager).await?;
        Ok(Self { pool })
    }

    /// `get(key)`. Degrades to `Ok(None)` on a store-unreachable error.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%key, error = %err, "cache unreachable, degrading to miss");
                None
            }
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    /// `incr(key)`. Returns the post-increment counter.
    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Idempotency key namespacing and caching (spec §4.2, §4.8 step 1/6).
pub mod idempotency {
    use super::Cache;
    use crate::models::UserId;
    use serde::{de::DeserializeOwned, Serialize};
    use std::time::Duration;

    fn key(user_id: UserId, client_key: &str) -> String {
        format!("idem:{}:{}", user_id, client_key)
    }

    pub async fn lookup<T: DeserializeOwned>(
        cache: &Cache,
        user_id: UserId,
        client_key: &str,
    ) -> Option<T> {
        let raw = cache.get(&key(user_id, client_key)).await?;
        serde_json::from_str(&raw).ok()
    }

    /// Cache a response for 24h. Spec §4.2: only 2xx responses are cached;
    /// callers decide whether to invoke this.
    pub async fn store<T: Serialize>(
        cache: &Cache,
        user_id: UserId,
        client_key: &str,
        ttl: Duration,
        response: &T,
    ) {
        if let Ok(body) = serde_json::to_string(response) {
            if let Err(err) = cache.set_with_ttl(&key(user_id, client_key), &body, ttl).await {
                tracing::warn!(%user_id, error = %err, "failed to cache idempotent response");
            }
        }
    }
}

/// Login lockout bookkeeping (spec §4.2, scenario 6).
pub mod lockout {
    use super::Cache;
    use std::time::Duration;

    fn attempts_key(email: &str) -> String {
        format!("attempts:{}", email.to_lowercase())
    }

    fn locked_key(email: &str) -> String {
        format!("locked:{}", email.to_lowercase())
    }

    /// Returns true if the account is currently locked. Fails open (allows
    /// login) if the store is unreachable, per §4.2's failure policy.
    pub async fn is_locked(cache: &Cache, email: &str) -> bool {
        cache.get(&locked_key(email)).await.is_some()
    }

    /// Record a failed login. On reaching `threshold` attempts within the
    /// attempt window, sets the locked flag with `lock_duration` TTL.
    pub async fn record_failure(
        cache: &Cache,
        email: &str,
        attempt_window: Duration,
        lock_duration: Duration,
        threshold: u32,
    ) {
        let key = attempts_key(email);
        let attempts = match cache.incr(&key).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%email, error = %err, "lockout store unreachable, allowing");
                return;
            }
        };
        if attempts == 1 {
            let _ = cache.expire(&key, attempt_window).await;
        }
        if attempts as u32 >= threshold {
            let _ = cache
                .set_with_ttl(&locked_key(email), "1", lock_duration)
                .await;
        }
    }

    /// A successful login clears the attempt counter; unlocking is driven
    /// solely by the locked flag's own TTL.
    pub async fn record_success(cache: &Cache, email: &str) {
        let _ = cache.delete(&attempts_key(email)).await;
    }
}

/// Token revocation list (spec §4.2, §4.7).
pub mod revocation {
    use super::Cache;
    use crate::models::TokenId;
    use std::time::Duration;

    fn key(token_id: TokenId) -> String {
        format!("revoked:{}", token_id.0)
    }

    pub async fn revoke(cache: &Cache, token_id: TokenId, remaining_validity: Duration) {
        let _ = cache
            .set_with_ttl(&key(token_id), "1", remaining_validity)
            .await;
    }

    pub async fn is_revoked(cache: &Cache, token_id: TokenId) -> bool {
        cache.get(&key(token_id)).await.is_some()
    }
}

/// Read-through hot-data cache (spec §4.9) — C9. Shares the C2 backing
/// store with its own key prefixes and TTLs; writes never consult this
/// cache, only invalidate it on the corresponding event bus publish.
pub mod hot_reads {
    use super::Cache;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    pub const BALANCE_TTL: Duration = Duration::from_secs(30);
    pub const ROOM_STATE_TTL: Duration = Duration::from_secs(10);
    pub const PRIZE_POOL_TTL: Duration = Duration::from_secs(5);
    pub const PARTICIPANT_COUNT_TTL: Duration = Duration::from_secs(15);
    pub const RECENT_TRANSACTIONS_TTL: Duration = Duration::from_secs(60);
    pub const ROOM_PARTICIPANTS_TTL: Duration = Duration::from_secs(20);

    #[derive(Default)]
    pub struct CacheStats {
        hits: AtomicU64,
        misses: AtomicU64,
        evictions: AtomicU64,
    }

    impl CacheStats {
        pub fn record_hit(&self) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        pub fn record_miss(&self) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        pub fn record_eviction(&self) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        pub fn snapshot(&self) -> (u64, u64, u64) {
            (
                self.hits.load(Ordering::Relaxed),
                self.misses.load(Ordering::Relaxed),
                self.evictions.load(Ordering::Relaxed),
            )
        }
    }

    pub async fn get_or_prefix(
        cache: &Cache,
        stats: &CacheStats,
        prefix: &str,
        id: &str,
    ) -> Option<String> {
        let key = format!("{prefix}:{id}");
        match cache.get(&key).await {
            Some(v) => {
                stats.record_hit();
                Some(v)
            }
            None => {
                stats.record_miss();
                None
            }
        }
    }

    pub async fn invalidate(cache: &Cache, stats: &CacheStats, prefix: &str, id: &str) {
        let key = format!("{prefix}:{id}");
        if cache.delete(&key).await.is_ok() {
            stats.record_eviction();
        }
    }
}
