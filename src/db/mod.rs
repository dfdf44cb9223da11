//! Database module: the durable work queue for batches and messages.
//!
//! - `model`: view models returned by queries (progress, sendable lookups).
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Every mutation that can race with another worker or controller is a
//! single conditional statement; callers never read-modify-write.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BatchProgress, SendableLookup};
