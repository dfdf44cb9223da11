//! Bounded pool of send workers.
//!
//! Every worker runs on its own [`SendContext`] obtained from a
//! [`ContextFactory`], so no connection is shared between workers or with the
//! controller. A worker is retired and replaced with a freshly connected one
//! after a fixed number of tasks, and replaced as well when it panics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LockKind, TransportConfig};
use crate::db;
use crate::dispatch::{
    send_message_by_id, ContextFactory, Mapper, SendContext, SendResult, SkipReason,
};
use crate::lock::{ConcurrencySafe, LockBackend, MemoryLock, RedisLock, SqliteLock};
use crate::transport;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool needs at least one worker")]
    Empty,
    #[error("worker {worker_id} could not connect: {reason}")]
    Startup { worker_id: usize, reason: String },
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Job {
    message_id: i64,
    reply: oneshot::Sender<SendResult>,
}

type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

enum Exit {
    /// Served its quota of tasks.
    Retired,
    /// The pool was closed and the queue is drained.
    Closed,
}

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    slots: Vec<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `size` workers, each retired after `max_tasks` sends.
    ///
    /// Every worker's first context is opened before this returns; failing to
    /// open any of them is a startup error and nothing is left running.
    pub async fn start(
        size: usize,
        max_tasks: usize,
        factory: Arc<dyn ContextFactory>,
    ) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::Empty);
        }
        let max_tasks = max_tasks.max(1);

        let mut contexts = Vec::with_capacity(size);
        for worker_id in 0..size {
            match factory.connect().await {
                Ok(ctx) => contexts.push(ctx),
                Err(err) => {
                    for ctx in contexts {
                        ctx.close().await;
                    }
                    return Err(PoolError::Startup {
                        worker_id,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        let (sender, receiver) = mpsc::channel(size * 2);
        let queue: JobQueue = Arc::new(Mutex::new(receiver));
        let closing = Arc::new(AtomicBool::new(false));

        let slots = contexts
            .into_iter()
            .enumerate()
            .map(|(worker_id, ctx)| {
                tokio::spawn(supervise(
                    worker_id,
                    ctx,
                    factory.clone(),
                    queue.clone(),
                    max_tasks,
                    closing.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(workers = size, max_tasks, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            slots,
            closing,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Stop accepting new work. Queued work still runs.
    pub fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.sender.take().is_some() {
            debug!("worker pool closed");
        }
    }

    /// Wait for every worker to finish. Call [`close`](Self::close) first.
    pub async fn join(self) {
        for (worker_id, res) in join_all(self.slots).await.into_iter().enumerate() {
            if let Err(err) = res {
                error!(worker_id, error = %err, "worker slot ended abnormally");
            }
        }
        info!("worker pool drained");
    }

    /// Abort every worker without waiting for in-flight sends.
    pub fn terminate(self) {
        warn!(workers = self.slots.len(), "terminating worker pool");
        self.closing.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            slot.abort();
        }
    }
}

#[async_trait]
impl Mapper for WorkerPool {
    async fn map(&self, message_ids: &[i64]) -> Vec<SendResult> {
        let lost = SendResult::Skipped(SkipReason::Lost);
        let Some(sender) = self.sender.as_ref() else {
            warn!(count = message_ids.len(), "worker pool is closed; nothing sent");
            return vec![lost; message_ids.len()];
        };

        let mut replies = Vec::with_capacity(message_ids.len());
        for &message_id in message_ids {
            let (reply, rx) = oneshot::channel();
            if sender.send(Job { message_id, reply }).await.is_err() {
                replies.push(None);
            } else {
                replies.push(Some(rx));
            }
        }

        join_all(replies.into_iter().map(|rx| async move {
            match rx {
                Some(rx) => rx.await.unwrap_or(lost),
                None => lost,
            }
        }))
        .await
    }
}

/// Keeps one worker slot filled until the pool closes.
async fn supervise(
    worker_id: usize,
    first: SendContext,
    factory: Arc<dyn ContextFactory>,
    queue: JobQueue,
    max_tasks: usize,
    closing: Arc<AtomicBool>,
) {
    let mut next = Some(first);
    loop {
        let ctx = match next.take() {
            Some(ctx) => ctx,
            None => match reconnect(worker_id, factory.as_ref(), &queue, &closing).await {
                Some(ctx) => ctx,
                None => return,
            },
        };

        match AssertUnwindSafe(work(worker_id, ctx, queue.clone(), max_tasks))
            .catch_unwind()
            .await
        {
            Ok(Exit::Closed) => {
                debug!(worker_id, "worker stopped");
                return;
            }
            Ok(Exit::Retired) => {
                debug!(worker_id, max_tasks, "worker retired; starting a fresh one");
            }
            Err(_) => {
                warn!(worker_id, "worker panicked; starting a fresh one");
            }
        }
    }
}

/// Open a fresh context for a slot. Until one opens, queued jobs are still
/// taken and answered `Skipped(Lost)` so no caller waits on a dead slot.
async fn reconnect(
    worker_id: usize,
    factory: &dyn ContextFactory,
    queue: &JobQueue,
    closing: &AtomicBool,
) -> Option<SendContext> {
    loop {
        match factory.connect().await {
            Ok(ctx) => return Some(ctx),
            Err(err) => {
                if closing.load(Ordering::SeqCst) {
                    warn!(worker_id, error = %err, "could not reconnect worker; pool is closing");
                    return None;
                }
                error!(worker_id, error = %err, "could not reconnect worker; retrying");
            }
        }

        let job = tokio::select! {
            job = async { queue.lock().await.recv().await } => job,
            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
        };
        let Some(job) = job else {
            return None;
        };
        warn!(
            worker_id,
            message_id = job.message_id,
            "worker has no connection; message not sent"
        );
        if job.reply.send(SendResult::Skipped(SkipReason::Lost)).is_err() {
            debug!(worker_id, message_id = job.message_id, "result not awaited");
        }
    }
}

async fn work(worker_id: usize, ctx: SendContext, queue: JobQueue, max_tasks: usize) -> Exit {
    let mut done = 0usize;
    let exit = loop {
        if done >= max_tasks {
            break Exit::Retired;
        }
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break Exit::Closed;
        };
        let result = send_message_by_id(&ctx, job.message_id).await;
        if job.reply.send(result).is_err() {
            debug!(worker_id, message_id = job.message_id, "result not awaited");
        }
        done += 1;
    };
    ctx.close().await;
    exit
}

enum LockSource {
    /// One table shared by every worker of this process.
    Memory(Arc<MemoryLock>),
    Sqlite,
    Redis(String),
}

/// Opens a fresh database pool, lock client and transport for each worker.
pub struct FreshConnections {
    database_url: String,
    lock: LockSource,
    lock_ttl: Duration,
    transport: TransportConfig,
}

impl FreshConnections {
    pub fn from_config(cfg: &Config, database_url: &str) -> Self {
        let lock = match cfg.lock.backend {
            LockKind::Memory => LockSource::Memory(Arc::new(MemoryLock::new())),
            LockKind::Sqlite => LockSource::Sqlite,
            LockKind::Redis => {
                LockSource::Redis(cfg.lock.redis_url.clone().unwrap_or_default())
            }
        };
        Self {
            database_url: database_url.to_string(),
            lock,
            lock_ttl: cfg.sending.lock_ttl(),
            transport: cfg.transport.clone(),
        }
    }
}

#[async_trait]
impl ContextFactory for FreshConnections {
    async fn connect(&self) -> Result<SendContext> {
        let pool = db::init_pool(&self.database_url, 1)
            .await
            .context("opening worker database connection")?;
        let backend: Arc<dyn LockBackend> = match &self.lock {
            LockSource::Memory(shared) => shared.clone(),
            LockSource::Sqlite => Arc::new(SqliteLock::new(pool.clone())),
            LockSource::Redis(url) => Arc::new(
                RedisLock::connect(url)
                    .await
                    .context("connecting worker to redis")?,
            ),
        };
        let transport =
            transport::from_config(&self.transport).context("building transport")?;
        Ok(SendContext::new(
            pool,
            ConcurrencySafe::new(backend, self.lock_ttl),
            transport,
        ))
    }
}
