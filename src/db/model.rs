//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{BatchStatus, Message};

/// Result of re-reading a message right before it is handed to the transport.
#[derive(Debug, Clone)]
pub enum SendableLookup {
    /// No message with that id exists (deleted since it was queued).
    Missing,
    /// Another attempt already recorded a `sent_ref`.
    AlreadySent,
    /// The owning batch left `Approved` (rejected or paused mid-flight).
    BatchNotApproved(BatchStatus),
    Ready(Message),
}

/// Counters shown to operators for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: i64,
    pub sent: i64,
    pub unsent: i64,
    pub errors: i64,
}
