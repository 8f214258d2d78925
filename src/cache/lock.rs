//! Cross-process mutual exclusion for notification dispatch.
//!
//! The dispatcher holds a lock only for the duration of one delivery
//! attempt. A lock that leaks (process death mid-attempt) expires on its
//! own via the TTL, so a stuck task can never wedge the queue.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{CacheError, RedisPool};

/// An acquired lock. Pass it back to [`DistributedLock::release`]; the
/// token prevents releasing a lock that has already expired and been
/// re-acquired by another process.
#[derive(Debug)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire `key` for at most `ttl`; None when already held.
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CacheError>;

    async fn release(&self, guard: LockGuard) -> Result<(), CacheError>;
}

/// Redis SET NX PX lock with token-checked release.
pub struct RedisLock {
    pool: RedisPool,
}

impl RedisLock {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CacheError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        Ok(acquired.map(|_| LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: LockGuard) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(())
    }
}

/// In-process lock with the same contract, for tests and single-node runs.
#[derive(Default)]
pub struct LocalLock {
    held: Mutex<HashSet<String>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_acquire(
        &self,
        key: &str,
        _ttl: Duration,
    ) -> Result<Option<LockGuard>, CacheError> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if held.insert(key.to_string()) {
            Ok(Some(LockGuard {
                key: key.to_string(),
                token: Uuid::new_v4().to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, guard: LockGuard) -> Result<(), CacheError> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        held.remove(&guard.key);
        Ok(())
    }
}
