use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batches with higher priority are sent first.
pub const PRIORITY_BATCH: i64 = 0;
pub const PRIORITY_TIME_CRITICAL: i64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    Uploading,
    PendingApproval,
    Approved,
    Rejected,
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Uploading => "UPLOADING",
            BatchStatus::PendingApproval => "PENDING",
            BatchStatus::Approved => "APPROVED",
            BatchStatus::Rejected => "REJECTED",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "UPLOADING" => Some(BatchStatus::Uploading),
            "PENDING" => Some(BatchStatus::PendingApproval),
            "APPROVED" => Some(BatchStatus::Approved),
            "REJECTED" => Some(BatchStatus::Rejected),
            "PROCESSING" => Some(BatchStatus::Processing),
            "COMPLETED" => Some(BatchStatus::Completed),
            _ => None,
        }
    }

    /// Human readable label used by the status report.
    pub fn label(&self) -> &'static str {
        match self {
            BatchStatus::Uploading => "Uploading",
            BatchStatus::PendingApproval => "Pending Approval",
            BatchStatus::Approved => "Approved",
            BatchStatus::Rejected => "Rejected",
            BatchStatus::Processing => "Processing",
            BatchStatus::Completed => "Completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: BatchStatus,
    pub priority: i64,
    pub error_count: i64,
    pub created_by: String,
    pub reviewed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub batch_id: i64,
    pub phone_number: String,
    pub from_shortcode: String,
    pub body: String,
    pub sent_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_sent(&self) -> bool {
        self.sent_ref.is_some()
    }
}

/// Input for creating a batch; new batches start in `Uploading` or
/// `PendingApproval`.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub description: String,
    pub priority: i64,
    pub created_by: String,
    pub status: BatchStatus,
}

impl NewBatch {
    pub fn new(name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority: PRIORITY_BATCH,
            created_by: created_by.into(),
            status: BatchStatus::PendingApproval,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = status;
        self
    }
}

/// One recipient row to enqueue. `from_shortcode` falls back to the
/// configured default when `None`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub phone_number: String,
    pub body: String,
    pub from_shortcode: Option<String>,
}

impl NewMessage {
    pub fn new(phone_number: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            body: body.into(),
            from_shortcode: None,
        }
    }
}
