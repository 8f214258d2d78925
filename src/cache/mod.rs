//! Redis-backed process-shared primitives: the per-task distributed lock
//! used by the notification dispatcher and the time-windowed sequence
//! counter behind external transaction numbers.

pub mod lock;
pub mod sequence;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use thiserror::Error;
use tracing::{error, info};

use crate::config::CacheConfig;

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis connection error: {0}")]
    Connection(String),
    #[error("redis command error: {0}")]
    Command(String),
}

/// Initialize the Redis connection pool and verify it with a PING.
pub async fn init_cache_pool(config: &CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        "Initializing Redis pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone())
        .map_err(|e| CacheError::Connection(e.to_string()))?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .build(manager)
        .await
        .map_err(|e| CacheError::Connection(e.to_string()))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::Connection(e.to_string()))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            error!("Redis PING failed: {}", e);
            CacheError::Connection(e.to_string())
        })?;
    drop(conn);

    info!("Redis pool initialized successfully");
    Ok(pool)
}

/// Redis health check used by the /health endpoint.
pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::Connection(e.to_string()))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| CacheError::Command(e.to_string()))?;
    Ok(())
}
