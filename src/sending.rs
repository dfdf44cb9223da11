//! The controller loop that drains approved batches at a fixed rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Sending;
use crate::db::{self, Pool};
use crate::dispatch::{dispatch_batch, ContextFactory, DispatchSummary};
use crate::pool::WorkerPool;

/// Longest single sleep between cycles, so a stop request is noticed quickly.
const SLEEP_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub messages_per_second: u32,
    pub concurrent_workers: usize,
    pub seconds_per_group: Duration,
    pub max_messages_per_worker: usize,
}

impl LoopSettings {
    pub fn from_config(sending: &Sending) -> Self {
        Self {
            messages_per_second: sending.messages_per_second,
            concurrent_workers: sending.concurrent_workers,
            seconds_per_group: sending.group_window(),
            max_messages_per_worker: sending.max_messages_per_worker,
        }
    }

    /// Messages allowed per cycle.
    pub fn budget(&self) -> i64 {
        let per_second = f64::from(self.messages_per_second);
        (per_second * self.seconds_per_group.as_secs_f64()).floor() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Draining,
}

/// Shared stop switch of a [`SendingLoop`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    controller_pid: u32,
}

impl ShutdownHandle {
    fn new(controller_pid: u32) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            controller_pid,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current cycle. Returns false when the
    /// loop was not running.
    pub fn request_stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Signal entry point; only the controller process reacts.
    pub fn on_signal(&self, signal: &str) {
        if std::process::id() != self.controller_pid {
            debug!(signal, "ignoring signal outside the controller process");
            return;
        }
        if self.request_stop() {
            warn!(signal, "received signal; stopping after the current cycle");
        } else {
            debug!(signal, "received signal while not running");
        }
    }
}

/// Forwards SIGTERM, SIGINT and SIGHUP to a [`ShutdownHandle`] until restored.
pub struct SignalListener {
    task: JoinHandle<()>,
}

impl SignalListener {
    #[cfg(unix)]
    pub fn install(shutdown: ShutdownHandle) -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        let task = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = term.recv() => "SIGTERM",
                    Some(()) = int.recv() => "SIGINT",
                    Some(()) = hup.recv() => "SIGHUP",
                    else => break,
                };
                shutdown.on_signal(name);
            }
        });
        Ok(Self { task })
    }

    #[cfg(not(unix))]
    pub fn install(shutdown: ShutdownHandle) -> std::io::Result<Self> {
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                shutdown.on_signal("Ctrl-C");
            }
        });
        Ok(Self { task })
    }

    /// Stop forwarding signals to the loop.
    pub fn restore(self) {
        self.task.abort();
    }
}

pub struct SendingLoop {
    settings: LoopSettings,
    pool: Pool,
    factory: Arc<dyn ContextFactory>,
    shutdown: ShutdownHandle,
    state: LoopState,
}

impl SendingLoop {
    /// The calling process becomes the controller.
    pub fn new(settings: LoopSettings, pool: Pool, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            settings,
            pool,
            factory,
            shutdown: ShutdownHandle::new(std::process::id()),
            state: LoopState::Stopped,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run one cycle, or cycles until stopped when `forever` is set.
    pub async fn send(&mut self, forever: bool) -> Result<()> {
        self.shutdown.running.store(true, Ordering::SeqCst);
        self.state = LoopState::Running;

        let signals = match SignalListener::install(self.shutdown.clone()) {
            Ok(signals) => signals,
            Err(err) => {
                self.stopped();
                return Err(err).context("installing signal handlers");
            }
        };

        let mut workers = match WorkerPool::start(
            self.settings.concurrent_workers,
            self.settings.max_messages_per_worker,
            self.factory.clone(),
        )
        .await
        {
            Ok(workers) => workers,
            Err(err) => {
                signals.restore();
                self.stopped();
                return Err(err).context("starting worker pool");
            }
        };

        info!(
            messages_per_second = self.settings.messages_per_second,
            workers = workers.size(),
            budget = self.settings.budget(),
            forever,
            "sending loop started"
        );

        let outcome = self.run_cycles(&workers, forever).await;

        self.state = LoopState::Draining;
        debug!("draining worker pool");
        workers.close();
        workers.join().await;
        signals.restore();
        self.stopped();
        info!("sending loop stopped");
        outcome
    }

    fn stopped(&mut self) {
        self.shutdown.running.store(false, Ordering::SeqCst);
        self.state = LoopState::Stopped;
    }

    async fn run_cycles(&self, workers: &WorkerPool, forever: bool) -> Result<()> {
        while self.shutdown.is_running() {
            let started = Instant::now();
            match self.cycle(workers).await {
                Ok(Some((batch_id, summary))) => info!(
                    batch_id,
                    sent = summary.sent,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    completed = summary.completed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sending cycle finished"
                ),
                Ok(None) => debug!("no approved batch to send"),
                Err(err) => {
                    error!(?err, "sending cycle failed");
                    if !forever {
                        return Err(err);
                    }
                }
            }
            if !forever {
                break;
            }
            self.pause(started).await;
        }
        Ok(())
    }

    async fn cycle(&self, workers: &WorkerPool) -> Result<Option<(i64, DispatchSummary)>> {
        let Some(batch) = db::next_eligible_batch(&self.pool).await? else {
            return Ok(None);
        };
        let summary = dispatch_batch(&self.pool, &batch, self.settings.budget(), workers).await?;
        Ok(Some((batch.id, summary)))
    }

    /// Sleep out the rest of the cycle window in short steps.
    async fn pause(&self, started: Instant) {
        let window = self.settings.seconds_per_group;
        while self.shutdown.is_running() {
            let elapsed = started.elapsed();
            if elapsed >= window {
                break;
            }
            tokio::time::sleep((window - elapsed).min(SLEEP_STEP)).await;
        }
    }
}
