//! Sending one slice of a batch.
//!
//! [`dispatch_batch`] picks the oldest unsent messages of a batch, hands their
//! ids to a [`Mapper`], and settles the batch afterwards: completed when
//! nothing is left unsent, otherwise charged with the failures of this slice.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, Pool, SendableLookup};
use crate::lock::{send_lock_key, ConcurrencySafe};
use crate::model::Batch;
use crate::transport::{Delivery, Transport};

/// Why a message was left alone on this attempt. None of these count as
/// errors against the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another sender holds the message's lock.
    LockHeld,
    Missing,
    AlreadySent,
    BatchNotApproved,
    /// The worker handling it died before reporting back.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    Failed,
    Skipped(SkipReason),
}

/// Everything one sender needs: its own store handle, lock client and
/// transport.
#[derive(Clone)]
pub struct SendContext {
    pub pool: Pool,
    pub guard: ConcurrencySafe,
    pub transport: Arc<dyn Transport>,
}

impl SendContext {
    pub fn new(pool: Pool, guard: ConcurrencySafe, transport: Arc<dyn Transport>) -> Self {
        Self {
            pool,
            guard,
            transport,
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Opens a fresh [`SendContext`]. Worker pools call this once per worker
/// generation so no worker reuses a connection opened elsewhere.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn connect(&self) -> Result<SendContext>;
}

/// Send one message if, and only if, it can be claimed under its lock and is
/// still sendable once claimed.
pub async fn send_message_by_id(ctx: &SendContext, message_id: i64) -> SendResult {
    ctx.guard
        .run(
            &send_lock_key(message_id),
            SendResult::Skipped(SkipReason::LockHeld),
            || send_claimed(ctx, message_id),
        )
        .await
}

async fn send_claimed(ctx: &SendContext, message_id: i64) -> SendResult {
    let message = match db::fetch_sendable(&ctx.pool, message_id).await {
        Ok(SendableLookup::Ready(message)) => message,
        Ok(SendableLookup::Missing) => {
            debug!(message_id, "message no longer exists; skipping");
            return SendResult::Skipped(SkipReason::Missing);
        }
        Ok(SendableLookup::AlreadySent) => {
            debug!(message_id, "message already sent; skipping");
            return SendResult::Skipped(SkipReason::AlreadySent);
        }
        Ok(SendableLookup::BatchNotApproved(status)) => {
            debug!(message_id, status = status.as_str(), "batch not approved; skipping");
            return SendResult::Skipped(SkipReason::BatchNotApproved);
        }
        Err(err) => {
            error!(?err, message_id, "could not load message for sending");
            return SendResult::Failed;
        }
    };

    let delivery = ctx
        .transport
        .send(&message.from_shortcode, &message.phone_number, &message.body)
        .await;

    match delivery {
        Ok(Delivery::Accepted { reference }) => {
            match db::mark_sent(&ctx.pool, message.id, &reference).await {
                Ok(true) => SendResult::Sent,
                Ok(false) => {
                    warn!(
                        message_id,
                        batch_id = message.batch_id,
                        "message was marked sent by someone else"
                    );
                    SendResult::Skipped(SkipReason::AlreadySent)
                }
                Err(err) => {
                    error!(
                        ?err,
                        message_id,
                        batch_id = message.batch_id,
                        %reference,
                        "gateway accepted message but recording it failed"
                    );
                    SendResult::Failed
                }
            }
        }
        Ok(Delivery::Declined) => {
            warn!(message_id, batch_id = message.batch_id, "gateway declined message");
            SendResult::Failed
        }
        Err(err) => {
            error!(
                error = %err,
                message_id,
                batch_id = message.batch_id,
                "failed to send message"
            );
            SendResult::Failed
        }
    }
}

/// Applies the guarded send to a list of message ids. Results come back in
/// the order of `message_ids`.
#[async_trait]
pub trait Mapper: Send + Sync {
    async fn map(&self, message_ids: &[i64]) -> Vec<SendResult>;
}

/// Sends one message after another on the caller's own context.
pub struct Sequential<'a> {
    ctx: &'a SendContext,
}

impl<'a> Sequential<'a> {
    pub fn new(ctx: &'a SendContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Mapper for Sequential<'_> {
    async fn map(&self, message_ids: &[i64]) -> Vec<SendResult> {
        let mut results = Vec::with_capacity(message_ids.len());
        for &id in message_ids {
            results.push(send_message_by_id(self.ctx, id).await);
        }
        results
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Whether this call moved the batch to `Completed`.
    pub completed: bool,
}

impl DispatchSummary {
    fn tally(results: &[SendResult]) -> Self {
        let mut summary = Self {
            attempted: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                SendResult::Sent => summary.sent += 1,
                SendResult::Failed => summary.failed += 1,
                SendResult::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Send at most `max_to_send` unsent messages of `batch` through `mapper`.
#[instrument(skip_all, fields(batch_id = batch.id))]
pub async fn dispatch_batch(
    pool: &Pool,
    batch: &Batch,
    max_to_send: i64,
    mapper: &dyn Mapper,
) -> Result<DispatchSummary> {
    let ids = db::unsent_message_ids(pool, batch.id, max_to_send)
        .await
        .context("loading unsent messages")?;

    let results = if ids.is_empty() {
        Vec::new()
    } else {
        mapper.map(&ids).await
    };
    let mut summary = DispatchSummary::tally(&results);

    if !db::has_unsent(pool, batch.id).await? {
        summary.completed = db::complete_batch(pool, batch.id)
            .await
            .context("completing batch")?;
        if summary.completed {
            info!(batch = %batch.name, "batch completed");
        }
    } else if summary.failed > 0 {
        db::increment_errors(pool, batch.id, summary.failed as i64)
            .await
            .context("recording send failures")?;
    }

    Ok(summary)
}
