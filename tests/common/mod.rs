#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bulk_sender::db::{self, Pool};
use bulk_sender::dispatch::{ContextFactory, SendContext};
use bulk_sender::lock::{ConcurrencySafe, LockBackend, MemoryLock, SqliteLock};
use bulk_sender::model::{BatchStatus, NewBatch, NewMessage};
use bulk_sender::transport::{Delivery, Transport, TransportError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestDb {
    _dir: TempDir,
    pub url: String,
    pub pool: Pool,
}

/// File-backed database so every worker can open its own connection.
pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("bulk.db").display());
    let pool = db::init_pool(&url, 4).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    TestDb {
        _dir: dir,
        url,
        pool,
    }
}

pub fn number(i: usize) -> String {
    format!("2189{:08}", i)
}

pub async fn approved_batch(pool: &Pool, name: &str, priority: i64, messages: usize) -> i64 {
    let id = db::create_batch(pool, &NewBatch::new(name, "uploader").with_priority(priority))
        .await
        .unwrap();
    db::add_messages(
        pool,
        id,
        (0..messages).map(|i| NewMessage::new(number(i), format!("{name} #{i}"))),
        "10020",
    )
    .await
    .unwrap();
    assert!(db::review_batch(pool, id, "reviewer", true).await.unwrap());
    id
}

pub async fn status_of(pool: &Pool, batch_id: i64) -> BatchStatus {
    db::get_batch(pool, batch_id).await.unwrap().unwrap().status
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub origin: String,
    pub destination: String,
    pub body: String,
}

/// Fake gateway that records every accepted message.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentRecord>>,
    fail_for: HashSet<String>,
    decline_for: HashSet<String>,
    panic_for: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for<I: IntoIterator<Item = String>>(mut self, numbers: I) -> Self {
        self.fail_for.extend(numbers);
        self
    }

    pub fn declining_for<I: IntoIterator<Item = String>>(mut self, numbers: I) -> Self {
        self.decline_for.extend(numbers);
        self
    }

    pub fn panicking_for<I: IntoIterator<Item = String>>(mut self, numbers: I) -> Self {
        self.panic_for.extend(numbers);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        origin: &str,
        destination: &str,
        body: &str,
    ) -> Result<Delivery, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_for.contains(destination) {
            panic!("gateway client crashed on {destination}");
        }
        if self.fail_for.contains(destination) {
            return Err(TransportError::NoRoute(destination.to_string()));
        }
        if self.decline_for.contains(destination) {
            return Ok(Delivery::Declined);
        }
        self.sent.lock().unwrap().push(SentRecord {
            origin: origin.to_string(),
            destination: destination.to_string(),
            body: body.to_string(),
        });
        Ok(Delivery::Accepted {
            reference: format!("ref-{n}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestLock {
    Memory,
    Sqlite,
}

/// Hands out contexts with their own single-connection pool, a lock client
/// and the shared fake transport.
pub struct TestFactory {
    url: String,
    memory: Arc<MemoryLock>,
    lock: TestLock,
    pub transport: Arc<RecordingTransport>,
    connects: AtomicUsize,
    attempts: AtomicUsize,
    connect_limit: Option<usize>,
}

impl TestFactory {
    pub fn new(url: &str, transport: RecordingTransport) -> Self {
        Self {
            url: url.to_string(),
            memory: Arc::new(MemoryLock::new()),
            lock: TestLock::Memory,
            transport: Arc::new(transport),
            connects: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            connect_limit: None,
        }
    }

    /// Only the first `n` connects succeed; later ones fail.
    pub fn with_connect_limit(mut self, n: usize) -> Self {
        self.connect_limit = Some(n);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn with_lock(mut self, lock: TestLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn memory_lock(&self) -> Arc<MemoryLock> {
        self.memory.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextFactory for TestFactory {
    async fn connect(&self) -> Result<SendContext> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.connect_limit.is_some_and(|limit| attempt >= limit) {
            return Err(anyhow::anyhow!("lock store is down"));
        }
        let pool = db::init_pool(&self.url, 1).await?;
        let backend: Arc<dyn LockBackend> = match self.lock {
            TestLock::Memory => self.memory.clone(),
            TestLock::Sqlite => Arc::new(SqliteLock::new(pool.clone())),
        };
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(SendContext::new(
            pool,
            ConcurrencySafe::new(backend, Duration::from_secs(60)),
            self.transport.clone(),
        ))
    }
}

/// Factory whose store is never reachable.
pub struct Unreachable;

#[async_trait]
impl ContextFactory for Unreachable {
    async fn connect(&self) -> Result<SendContext> {
        Err(anyhow::anyhow!("database is unreachable"))
    }
}
