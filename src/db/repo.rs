use super::model::{BatchProgress, SendableLookup};
use crate::model::{Batch, BatchStatus, Message, NewBatch, NewMessage};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Messages are inserted in transactions of this many rows.
const INSERT_CHUNK: usize = 10_000;

const BATCH_COLUMNS: &str = "id, name, description, status, priority, error_count, \
                             created_by, reviewed_by, created_at, modified_at";

const MESSAGE_COLUMNS: &str =
    "id, batch_id, phone_number, from_shortcode, body, sent_ref, created_at";

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync: workers write concurrently and a sent_ref must
    // survive a crash right after the gateway accepted the message.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let id: i64 = row.try_get("id")?;
    let status_str: String = row.try_get("status")?;
    let status = BatchStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("batch {} has unknown status {}", id, status_str))?;
    Ok(Batch {
        id,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status,
        priority: row.try_get("priority")?,
        error_count: row.try_get("error_count")?,
        created_by: row.try_get("created_by")?,
        reviewed_by: row.try_get("reviewed_by")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        phone_number: row.try_get("phone_number")?,
        from_shortcode: row.try_get("from_shortcode")?,
        body: row.try_get("body")?,
        sent_ref: row.try_get("sent_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

#[instrument(skip_all)]
pub async fn create_batch(pool: &Pool, batch: &NewBatch) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO batches \
         (name, description, status, priority, created_by, created_at, modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&batch.name)
    .bind(&batch.description)
    .bind(batch.status.as_str())
    .bind(batch.priority)
    .bind(&batch.created_by)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<Option<Batch>> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool) -> Result<Vec<Batch>> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY priority DESC, id ASC");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(batch_from_row).collect()
}

/// Bulk-insert messages for a batch, committing every `INSERT_CHUNK` rows.
/// Returns the number of rows inserted.
#[instrument(skip_all, fields(batch_id = batch_id))]
pub async fn add_messages<I>(
    pool: &Pool,
    batch_id: i64,
    messages: I,
    default_shortcode: &str,
) -> Result<u64>
where
    I: IntoIterator<Item = NewMessage>,
{
    let mut inserted = 0u64;
    let mut chunk: Vec<NewMessage> = Vec::with_capacity(INSERT_CHUNK.min(1024));
    let mut iter = messages.into_iter().peekable();
    while iter.peek().is_some() {
        chunk.clear();
        chunk.extend(iter.by_ref().take(INSERT_CHUNK));

        let mut tx = pool.begin().await?;
        for msg in &chunk {
            let shortcode = msg.from_shortcode.as_deref().unwrap_or(default_shortcode);
            sqlx::query(
                "INSERT INTO messages (batch_id, phone_number, from_shortcode, body, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(batch_id)
            .bind(&msg.phone_number)
            .bind(shortcode)
            .bind(&msg.body)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        inserted += chunk.len() as u64;
    }
    Ok(inserted)
}

/// Approve or reject a batch on behalf of `reviewer`.
///
/// Approval is allowed from pending review and also from `Rejected` or
/// `Completed`, which re-opens the batch for dispatch. Rejection is allowed
/// while the batch is pending or approved. Returns whether the batch changed.
#[instrument(skip_all, fields(batch_id = batch_id, approve = approve))]
pub async fn review_batch(
    pool: &Pool,
    batch_id: i64,
    reviewer: &str,
    approve: bool,
) -> Result<bool> {
    let (target, allowed): (BatchStatus, &str) = if approve {
        (
            BatchStatus::Approved,
            "'PENDING', 'REJECTED', 'COMPLETED', 'APPROVED'",
        )
    } else {
        (BatchStatus::Rejected, "'PENDING', 'APPROVED'")
    };
    let sql = format!(
        "UPDATE batches SET status = ?, reviewed_by = ?, modified_at = ? \
         WHERE id = ? AND status IN ({allowed})"
    );
    let res = sqlx::query(&sql)
        .bind(target.as_str())
        .bind(reviewer)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Highest-priority approved batch; ties go to the oldest batch id.
#[instrument(skip_all)]
pub async fn next_eligible_batch(pool: &Pool) -> Result<Option<Batch>> {
    let sql = format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE status = ? \
         ORDER BY priority DESC, id ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(BatchStatus::Approved.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn unsent_messages(pool: &Pool, batch_id: i64, limit: i64) -> Result<Vec<Message>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE batch_id = ? AND sent_ref IS NULL \
         ORDER BY created_at ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(batch_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(message_from_row).collect()
}

/// Same slice as [`unsent_messages`], ids only. This is what gets queued to
/// workers; each worker re-reads the row itself.
#[instrument(skip_all)]
pub async fn unsent_message_ids(pool: &Pool, batch_id: i64, limit: i64) -> Result<Vec<i64>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM messages WHERE batch_id = ? AND sent_ref IS NULL \
         ORDER BY created_at ASC, id ASC LIMIT ?",
    )
    .bind(batch_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn has_unsent(pool: &Pool, batch_id: i64) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT EXISTS (SELECT 1 FROM messages WHERE batch_id = ? AND sent_ref IS NULL)",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(found != 0)
}

/// Re-read a message together with its batch status right before sending.
#[instrument(skip_all)]
pub async fn fetch_sendable(pool: &Pool, message_id: i64) -> Result<SendableLookup> {
    let row = sqlx::query(
        "SELECT m.id AS id, m.batch_id AS batch_id, m.phone_number AS phone_number, \
                m.from_shortcode AS from_shortcode, m.body AS body, m.sent_ref AS sent_ref, \
                m.created_at AS created_at, b.status AS batch_status \
         FROM messages m JOIN batches b ON b.id = m.batch_id \
         WHERE m.id = ?",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(SendableLookup::Missing);
    };

    let message = message_from_row(&row)?;
    if message.is_sent() {
        return Ok(SendableLookup::AlreadySent);
    }
    let status_str: String = row.try_get("batch_status")?;
    let status = BatchStatus::parse_status(&status_str).ok_or_else(|| {
        anyhow!(
            "batch {} has unknown status {}",
            message.batch_id,
            status_str
        )
    })?;
    if status != BatchStatus::Approved {
        return Ok(SendableLookup::BatchNotApproved(status));
    }
    Ok(SendableLookup::Ready(message))
}

/// Record the transport reference for a message. Only succeeds while
/// `sent_ref` is still null, so a message can be marked sent once.
#[instrument(skip_all)]
pub async fn mark_sent(pool: &Pool, message_id: i64, sent_ref: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE messages SET sent_ref = ? WHERE id = ? AND sent_ref IS NULL")
        .bind(sent_ref)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn increment_errors(pool: &Pool, batch_id: i64, n: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET error_count = error_count + ?, modified_at = ? WHERE id = ?",
    )
    .bind(n)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_status(pool: &Pool, batch_id: i64, status: BatchStatus) -> Result<()> {
    sqlx::query("UPDATE batches SET status = ?, modified_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a batch from `Approved` to `Completed`. A batch that was rejected in
/// the meantime keeps its status.
#[instrument(skip_all)]
pub async fn complete_batch(pool: &Pool, batch_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batches SET status = ?, modified_at = ? WHERE id = ? AND status = ?",
    )
    .bind(BatchStatus::Completed.as_str())
    .bind(Utc::now())
    .bind(batch_id)
    .bind(BatchStatus::Approved.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn batch_progress(pool: &Pool, batch_id: i64) -> Result<BatchProgress> {
    let row = sqlx::query(
        "SELECT b.error_count AS errors, \
                (SELECT COUNT(*) FROM messages WHERE batch_id = b.id) AS total, \
                (SELECT COUNT(*) FROM messages \
                 WHERE batch_id = b.id AND sent_ref IS NOT NULL) AS sent \
         FROM batches b WHERE b.id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    let total: i64 = row.try_get("total")?;
    let sent: i64 = row.try_get("sent")?;
    Ok(BatchProgress {
        total,
        sent,
        unsent: total - sent,
        errors: row.try_get("errors")?,
    })
}

/// Approximate time needed to send `unsent` messages at the given rate.
/// `None` when nothing is left; anything under a second rounds up to one.
pub fn time_remaining(unsent: i64, messages_per_second: u32) -> Option<Duration> {
    if unsent <= 0 {
        return None;
    }
    let rate = f64::from(messages_per_second.max(1));
    let secs = (unsent as f64 / rate).max(1.0);
    Some(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PRIORITY_TIME_CRITICAL;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn approved_batch(pool: &Pool, name: &str, priority: i64) -> i64 {
        let id = create_batch(pool, &NewBatch::new(name, "admin").with_priority(priority))
            .await
            .unwrap();
        assert!(review_batch(pool, id, "reviewer", true).await.unwrap());
        id
    }

    fn recipients(n: usize) -> Vec<NewMessage> {
        (0..n)
            .map(|i| NewMessage::new(format!("21891{:07}", i), format!("hello {i}")))
            .collect()
    }

    #[tokio::test]
    async fn next_eligible_batch_follows_priority() {
        let pool = setup_pool().await;
        let a = approved_batch(&pool, "A", 5).await;
        let b = approved_batch(&pool, "B", 2).await;
        let c = approved_batch(&pool, "C", 9).await;
        assert!(review_batch(&pool, c, "reviewer", false).await.unwrap());

        let next = next_eligible_batch(&pool).await.unwrap().unwrap();
        assert_eq!(next.id, a);

        set_status(&pool, a, BatchStatus::Completed).await.unwrap();
        let next = next_eligible_batch(&pool).await.unwrap().unwrap();
        assert_eq!(next.id, b);

        set_status(&pool, b, BatchStatus::Rejected).await.unwrap();
        assert!(next_eligible_batch(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_priority_prefers_lowest_id() {
        let pool = setup_pool().await;
        let first = approved_batch(&pool, "first", PRIORITY_TIME_CRITICAL).await;
        let _second = approved_batch(&pool, "second", PRIORITY_TIME_CRITICAL).await;
        let next = next_eligible_batch(&pool).await.unwrap().unwrap();
        assert_eq!(next.id, first);
    }

    #[tokio::test]
    async fn unsent_messages_are_oldest_first_and_bounded() {
        let pool = setup_pool().await;
        let bid = approved_batch(&pool, "fifo", 0).await;
        let inserted = add_messages(&pool, bid, recipients(5), "10020").await.unwrap();
        assert_eq!(inserted, 5);

        let slice = unsent_messages(&pool, bid, 3).await.unwrap();
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].body, "hello 0");
        assert_eq!(slice[2].body, "hello 2");
        assert_eq!(slice[0].from_shortcode, "10020");

        assert!(mark_sent(&pool, slice[0].id, "ref-0").await.unwrap());
        let ids = unsent_message_ids(&pool, bid, 10).await.unwrap();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&slice[0].id));
        assert!(unsent_message_ids(&pool, bid, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_sent_only_once() {
        let pool = setup_pool().await;
        let bid = approved_batch(&pool, "once", 0).await;
        add_messages(&pool, bid, recipients(1), "10020").await.unwrap();
        let msg = &unsent_messages(&pool, bid, 1).await.unwrap()[0];

        assert!(mark_sent(&pool, msg.id, "first").await.unwrap());
        assert!(!mark_sent(&pool, msg.id, "second").await.unwrap());

        let stored: Option<String> =
            sqlx::query_scalar("SELECT sent_ref FROM messages WHERE id = ?")
                .bind(msg.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored.as_deref(), Some("first"));
        assert!(!has_unsent(&pool, bid).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_sendable_reports_why_a_message_is_skipped() {
        let pool = setup_pool().await;
        let bid = approved_batch(&pool, "lookup", 0).await;
        add_messages(&pool, bid, recipients(2), "10020").await.unwrap();
        let msgs = unsent_messages(&pool, bid, 2).await.unwrap();

        assert!(matches!(
            fetch_sendable(&pool, msgs[0].id).await.unwrap(),
            SendableLookup::Ready(_)
        ));
        assert!(matches!(
            fetch_sendable(&pool, 9_999).await.unwrap(),
            SendableLookup::Missing
        ));

        mark_sent(&pool, msgs[0].id, "r").await.unwrap();
        assert!(matches!(
            fetch_sendable(&pool, msgs[0].id).await.unwrap(),
            SendableLookup::AlreadySent
        ));

        review_batch(&pool, bid, "reviewer", false).await.unwrap();
        assert!(matches!(
            fetch_sendable(&pool, msgs[1].id).await.unwrap(),
            SendableLookup::BatchNotApproved(BatchStatus::Rejected)
        ));
    }

    #[tokio::test]
    async fn counters_and_completion() {
        let pool = setup_pool().await;
        let bid = approved_batch(&pool, "counters", 0).await;
        add_messages(&pool, bid, recipients(3), "10020").await.unwrap();

        increment_errors(&pool, bid, 2).await.unwrap();
        increment_errors(&pool, bid, 1).await.unwrap();
        let progress = batch_progress(&pool, bid).await.unwrap();
        assert_eq!(
            progress,
            BatchProgress {
                total: 3,
                sent: 0,
                unsent: 3,
                errors: 3
            }
        );

        assert!(complete_batch(&pool, bid).await.unwrap());
        assert!(!complete_batch(&pool, bid).await.unwrap());
        let batch = get_batch(&pool, bid).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);

        // Re-review re-opens dispatch.
        assert!(review_batch(&pool, bid, "reviewer", true).await.unwrap());
        assert_eq!(next_eligible_batch(&pool).await.unwrap().unwrap().id, bid);
    }

    #[tokio::test]
    async fn uploading_batch_cannot_be_approved() {
        let pool = setup_pool().await;
        let bid = create_batch(
            &pool,
            &NewBatch::new("upload", "admin").with_status(BatchStatus::Uploading),
        )
        .await
        .unwrap();
        assert!(!review_batch(&pool, bid, "reviewer", true).await.unwrap());
        assert!(next_eligible_batch(&pool).await.unwrap().is_none());
    }

    #[test]
    fn time_remaining_rounds_up() {
        assert_eq!(time_remaining(0, 50), None);
        assert_eq!(time_remaining(10, 50), Some(Duration::from_secs(1)));
        assert_eq!(time_remaining(500, 50), Some(Duration::from_secs(10)));
    }

    #[test]
    fn prepare_url_leaves_memory_urls_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }
}
