// Distributed locking with Redis SET NX PX and compare-and-delete release

use crate::db::RedisPool;
use crate::errors::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a release by the rightful owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The key held our token and was deleted
    Released,
    /// The key was already gone (TTL expiry)
    Expired,
}

/// Distributed lock trait for per-source mutual exclusion
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Atomic set-if-absent with TTL. `Ok(false)` means someone else holds the key.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Atomic compare-and-delete. A token mismatch returns `LockError::NotOwner`
    /// and leaves the lock held.
    async fn release(&self, key: &str, token: &str) -> Result<ReleaseOutcome, LockError>;

    /// Read-only existence check for status reporting. Never use this to decide
    /// whether to acquire.
    async fn probe(&self, key: &str) -> Result<bool, LockError>;
}

/// Fresh owner token for one acquisition
pub fn new_lock_token() -> String {
    Uuid::new_v4().to_string()
}

// Returns 1 when deleted, 0 when the key is absent, -1 when another token owns it
const RELEASE_SCRIPT: &str = r#"
    local current = redis.call("get", KEYS[1])
    if not current then
        return 0
    elseif current == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return -1
    end
"#;

/// Redis-backed lock. Contention is reported immediately; the next
/// scheduler pass is the retry.
pub struct RedisLock {
    pool: RedisPool,
}

impl RedisLock {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    #[instrument(skip(self, token), fields(lock_key = %key, ttl_seconds = ttl.as_secs()))]
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.pool.get_connection();

        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        debug!(acquired, "Lock acquire attempted");
        Ok(acquired)
    }

    #[instrument(skip(self, token), fields(lock_key = %key))]
    async fn release(&self, key: &str, token: &str) -> Result<ReleaseOutcome, LockError> {
        let mut conn = self.pool.get_connection();

        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => {
                debug!("Lock released");
                Ok(ReleaseOutcome::Released)
            }
            0 => {
                warn!("Lock expired before release");
                Ok(ReleaseOutcome::Expired)
            }
            _ => {
                error!("Release refused: lock is owned by another token");
                Err(LockError::NotOwner {
                    key: key.to_string(),
                    token: token.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self), fields(lock_key = %key))]
    async fn probe(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get_connection();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }
}

struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// Process-local lock with TTL expiry, same contract as `RedisLock`
#[derive(Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if let Some(current) = held.get(key) {
            if current.expires_at > now {
                return Ok(false);
            }
        }

        held.insert(
            key.to_string(),
            HeldLock {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        info!(lock_key = %key, "Lock acquired");
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<ReleaseOutcome, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        match held.get(key) {
            None => Ok(ReleaseOutcome::Expired),
            Some(current) if current.expires_at <= now => {
                held.remove(key);
                Ok(ReleaseOutcome::Expired)
            }
            Some(current) if current.token == token => {
                held.remove(key);
                Ok(ReleaseOutcome::Released)
            }
            Some(_) => {
                error!(lock_key = %key, "Release refused: lock is owned by another token");
                Err(LockError::NotOwner {
                    key: key.to_string(),
                    token: token.to_string(),
                })
            }
        }
    }

    async fn probe(&self, key: &str) -> Result<bool, LockError> {
        let held = self.held.lock().await;
        Ok(held.get(key).is_some_and(|l| l.expires_at > Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let lock = InMemoryLock::new();
        assert!(lock.acquire("lock:A", "t1", TTL).await.unwrap());
        assert!(!lock.acquire("lock:A", "t2", TTL).await.unwrap());
        assert!(lock.acquire("lock:B", "t2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_keeps_lock() {
        let lock = InMemoryLock::new();
        lock.acquire("lock:A", "t1", TTL).await.unwrap();

        let err = lock.release("lock:A", "t2").await.unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        assert!(lock.probe("lock:A").await.unwrap());

        assert_eq!(lock.release("lock:A", "t1").await.unwrap(), ReleaseOutcome::Released);
        assert!(!lock.probe("lock:A").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_reacquired() {
        let lock = InMemoryLock::new();
        lock.acquire("lock:A", "t1", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!lock.probe("lock:A").await.unwrap());
        assert!(lock.acquire("lock:A", "t2", TTL).await.unwrap());

        // The stale holder cannot release the new owner's lock
        assert!(lock.release("lock:A", "t1").await.is_err());
        assert!(lock.probe("lock:A").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_of_missing_key_reports_expired() {
        let lock = InMemoryLock::new();
        assert_eq!(lock.release("lock:A", "t1").await.unwrap(), ReleaseOutcome::Expired);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_lock_compare_and_delete() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };
        let pool = RedisPool::new(&config).await.unwrap();
        let lock = RedisLock::new(pool);
        let key = format!("lock:test-{}", Uuid::new_v4());

        assert!(lock.acquire(&key, "t1", TTL).await.unwrap());
        assert!(!lock.acquire(&key, "t2", TTL).await.unwrap());
        assert!(lock.release(&key, "t2").await.is_err());
        assert!(lock.probe(&key).await.unwrap());
        assert_eq!(lock.release(&key, "t1").await.unwrap(), ReleaseOutcome::Released);
        assert!(!lock.probe(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_lock_contention_is_reported_without_waiting() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };
        let pool = RedisPool::new(&config).await.unwrap();
        let lock = RedisLock::new(pool);
        let key = format!("lock:test-{}", Uuid::new_v4());

        assert!(lock.acquire(&key, "t1", TTL).await.unwrap());
        let started = std::time::Instant::now();
        assert!(!lock.acquire(&key, "t2", TTL).await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(150));
        lock.release(&key, "t1").await.unwrap();
    }
}
