//! External-facing transaction number generation.
//!
//! Numbers look like `P2024051409300000042`: a kind prefix, the start of
//! the current one-minute window, and a counter that is atomic within that
//! window. The counter key expires shortly after the window closes, so the
//! keyspace stays bounded.

use async_trait::async_trait;
use chrono::{DurationRound, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{CacheError, RedisPool};

/// Number prefixes per transaction kind.
pub const ORDER_NO_PREFIX: &str = "O";
pub const EXTENSION_NO_PREFIX: &str = "P";
pub const REFUND_NO_PREFIX: &str = "R";
pub const TRANSFER_NO_PREFIX: &str = "T";

#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// Produce the next unique, time-ordered number for `prefix`.
    async fn next(&self, prefix: &str) -> Result<String, CacheError>;
}

fn window_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

fn format_no(prefix: &str, window: chrono::DateTime<Utc>, seq: u64) -> String {
    format!("{}{}{:06}", prefix, window.format("%Y%m%d%H%M"), seq)
}

/// Redis-backed generator shared by all worker processes.
pub struct RedisSequence {
    pool: RedisPool,
}

impl RedisSequence {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceGenerator for RedisSequence {
    async fn next(&self, prefix: &str) -> Result<String, CacheError> {
        let window = window_start();
        let key = format!("pay:seq:{}:{}", prefix, window.format("%Y%m%d%H%M"));

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let seq: u64 = redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        // Keep the key a little past the window so late INCRs on the
        // boundary still hit the live counter.
        let _: bool = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(120)
            .arg("NX")
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        Ok(format_no(prefix, window, seq))
    }
}

/// In-process generator for tests and single-node runs.
#[derive(Default)]
pub struct LocalSequence {
    counters: Mutex<HashMap<String, u64>>,
}

impl LocalSequence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceGenerator for LocalSequence {
    async fn next(&self, prefix: &str) -> Result<String, CacheError> {
        let window = window_start();
        let key = format!("{}:{}", prefix, window.format("%Y%m%d%H%M"));
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = counters.entry(key).or_insert(0);
        *seq += 1;
        Ok(format_no(prefix, window, *seq))
    }
}
