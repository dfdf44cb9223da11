//! TTL-bounded send lock.
//!
//! A lock is a marker stored under a deterministic key with an expiry. Taking
//! it is always one atomic set-if-absent against the backing store, so two
//! callers can never both observe "free" and both proceed. The TTL bounds how
//! long a crashed holder blocks retries.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::Pool;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Redis connection error: {0}")]
    Connection(String),
    #[error("Redis operation error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Key used to serialise sends of one message across every worker and
/// controller sharing the lock store.
pub fn send_lock_key(message_id: i64) -> String {
    format!("lock.dispatch.send_message.{message_id}")
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set a marker for `key` unless a live one exists. Returns whether this
    /// caller now holds the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

/// Process-local lock table. Only correct when every sender lives in the
/// same process, which holds for the in-process worker pool.
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match held.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Lock markers kept in the `send_locks` table of the shared database.
#[derive(Debug, Clone)]
pub struct SqliteLock {
    pool: Pool,
}

impl SqliteLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for SqliteLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;
        // Insert, or take over a marker whose expiry has passed; a live marker
        // leaves the row untouched and zero rows affected.
        let res = sqlx::query(
            "INSERT INTO send_locks (lock_key, expires_at) VALUES (?, ?) \
             ON CONFLICT (lock_key) DO UPDATE SET expires_at = excluded.expires_at \
             WHERE send_locks.expires_at <= ?",
        )
        .bind(key)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM send_locks WHERE lock_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Redis-backed markers using `SET key value NX PX ttl`.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| LockError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockBackend for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("true")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// Runs an operation only while holding the lock for a key.
///
/// The marker is released on every exit path of the operation, panics
/// included, so a retry does not have to wait out the TTL.
#[derive(Clone)]
pub struct ConcurrencySafe {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
}

impl ConcurrencySafe {
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Call `op` if the lock for `key` can be taken, otherwise return
    /// `default` without calling it.
    pub async fn run<T, F, Fut>(&self, key: &str, default: T, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.backend.try_acquire(key, self.ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    key,
                    "not running guarded call; another caller holds the lock"
                );
                return default;
            }
            Err(err) => {
                warn!(?err, key, "could not take lock; skipping guarded call");
                return default;
            }
        }
        debug!(key, "lock acquired");

        let outcome = AssertUnwindSafe(op()).catch_unwind().await;

        if let Err(err) = self.backend.release(key).await {
            warn!(?err, key, "failed to release lock; it expires with its TTL");
        }

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
