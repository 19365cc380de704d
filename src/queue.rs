use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::Result;

/// Retry backoff lookup, indexed by attempt number (attempt 1 -> 5 minutes).
/// Attempts beyond the table fall back to a fixed delay.
const BACKOFF_MINUTES: [i64; 3] = [5, 15, 30];
const BACKOFF_DEFAULT_MINUTES: i64 = 60;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl EmailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Processing => "processing",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
            EmailStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EmailStatus::Sent | EmailStatus::Failed | EmailStatus::Cancelled
        )
    }
}

/// One persisted queue row. Payload fields are immutable after insert; only
/// the state-machine columns change afterwards.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: String,
    pub status: EmailStatus,
    pub email_type: String,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub template_id: Option<String>,
    pub template_data: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub priority: i64,
    pub batch_id: Option<String>,
    pub campaign_id: Option<String>,
    pub user_id: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller submits; validation is the caller's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailSpec {
    pub email_type: String,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub template_id: Option<String>,
    /// Opaque structured payload forwarded verbatim to the provider.
    pub template_data: Option<serde_json::Value>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub priority: Option<i64>,
    pub campaign_id: Option<String>,
    pub user_id: Option<String>,
    pub max_attempts: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct SenderDefaults {
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total: usize,
    /// Read back from the store after commit, not merely the input length.
    pub queued: i64,
}

pub(crate) fn backoff(attempt: i64) -> chrono::Duration {
    let idx = usize::try_from(attempt.max(1) - 1).unwrap_or(usize::MAX);
    let minutes = BACKOFF_MINUTES
        .get(idx)
        .copied()
        .unwrap_or(BACKOFF_DEFAULT_MINUTES);
    chrono::Duration::minutes(minutes)
}

async fn insert_entry(
    conn: &mut SqliteConnection,
    defaults: &SenderDefaults,
    spec: &EmailSpec,
    batch_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let template_data = spec
        .template_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO email_queue (
            id, status, email_type, recipient_email, recipient_name, subject,
            html_content, text_content, template_id, template_data,
            from_email, from_name, priority, batch_id, campaign_id, user_id,
            attempts, max_attempts, created_at, updated_at
        )
        VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&spec.email_type)
    .bind(&spec.recipient_email)
    .bind(&spec.recipient_name)
    .bind(&spec.subject)
    .bind(&spec.html_content)
    .bind(&spec.text_content)
    .bind(&spec.template_id)
    .bind(template_data)
    .bind(spec.from_email.as_deref().unwrap_or(&defaults.from_email))
    .bind(spec.from_name.as_deref().unwrap_or(&defaults.from_name))
    .bind(spec.priority.unwrap_or(0))
    .bind(batch_id)
    .bind(&spec.campaign_id)
    .bind(&spec.user_id)
    .bind(spec.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// Durably insert one job in `pending` status. No external side effects.
pub async fn enqueue(
    pool: &SqlitePool,
    defaults: &SenderDefaults,
    spec: &EmailSpec,
) -> Result<String> {
    let mut conn = pool.acquire().await?;
    insert_entry(&mut conn, defaults, spec, None, Utc::now()).await
}

/// Insert a batch of jobs under one fresh batch id, all-or-nothing.
///
/// Any constraint violation rolls the whole transaction back; no partial
/// batch ever exists. `queued` is counted from the store after commit.
pub async fn enqueue_batch(
    pool: &SqlitePool,
    defaults: &SenderDefaults,
    specs: &[EmailSpec],
) -> Result<BatchReceipt> {
    let batch_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let mut tx = pool.begin().await?;
    for spec in specs {
        insert_entry(&mut tx, defaults, spec, Some(&batch_id), now).await?;
    }
    tx.commit().await?;

    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM email_queue WHERE batch_id = ?")
        .bind(&batch_id)
        .fetch_one(pool)
        .await?;

    Ok(BatchReceipt {
        batch_id,
        total: specs.len(),
        queued,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>("SELECT * FROM email_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(entry)
}

/// Atomically claim up to `limit` ready jobs for this worker.
///
/// Key idea:
/// - Pick runnable rows: status = pending AND (next_retry_at IS NULL OR <= now)
/// - Flip them to processing and stamp last_attempt_at inside ONE statement,
///   so concurrent claimers serialize on the store's write lock and can never
///   return the same row. This is the sole cross-process safety mechanism.
pub async fn claim_ready(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<QueueEntry>> {
    if limit < 1 {
        return Ok(Vec::new());
    }

    let mut claimed = sqlx::query_as::<_, QueueEntry>(
        r#"
        UPDATE email_queue
        SET status = 'processing',
            last_attempt_at = ?1,
            updated_at = ?1
        WHERE id IN (
            SELECT id
            FROM email_queue
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY priority DESC, created_at ASC
            LIMIT ?2
        )
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    // RETURNING does not promise the subselect's order.
    claimed.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });

    Ok(claimed)
}

/// Reset `processing` rows whose lease expired back to `pending`.
///
/// Recovers work orphaned by a crashed or killed worker. Idempotent and safe
/// to run redundantly from multiple processes.
pub async fn recover_abandoned(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    lease_timeout: chrono::Duration,
) -> Result<u64> {
    let cutoff = now - lease_timeout;
    let result = sqlx::query(
        r#"
        UPDATE email_queue
        SET status = 'pending',
            next_retry_at = ?1,
            updated_at = ?1
        WHERE status = 'processing'
          AND last_attempt_at IS NOT NULL
          AND last_attempt_at < ?2
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record a successful send. Terminal; the row is never reclaimed.
///
/// Returns false when the claimant no longer owned the row (its lease was
/// recovered and the row was resolved by another worker); nothing is
/// recorded in that case.
pub async fn record_sent(
    pool: &SqlitePool,
    id: &str,
    provider_message_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE email_queue
        SET status = 'sent',
            attempts = attempts + 1,
            sent_at = ?2,
            provider_message_id = ?3,
            error_message = NULL,
            next_retry_at = NULL,
            updated_at = ?2
        WHERE id = ?1 AND status = 'processing'
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(provider_message_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry scheduled; the row is pending again with next_retry_at set.
    Scheduled { retry_at: DateTime<Utc> },
    /// max_attempts reached; the row is terminally failed.
    Exhausted,
    /// The claimant no longer owned the row (lease recovered and resolved
    /// by another worker); nothing was recorded.
    Stale,
}

/// Record a failed send attempt: bump attempts, then either schedule a retry
/// per the backoff table or fail the row terminally.
///
/// The outcome reflects what was actually written: if the row is no longer
/// `processing` under this claimant, `Stale` is returned and the row is left
/// exactly as the winning worker resolved it.
pub async fn record_failure(
    pool: &SqlitePool,
    entry: &QueueEntry,
    error: &str,
    now: DateTime<Utc>,
) -> Result<FailureOutcome> {
    let attempts = entry.attempts + 1;

    if attempts >= entry.max_attempts {
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'failed',
                attempts = ?2,
                error_message = ?3,
                next_retry_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(&entry.id)
        .bind(attempts)
        .bind(error)
        .bind(now)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(FailureOutcome::Stale);
        }
        return Ok(FailureOutcome::Exhausted);
    }

    let retry_at = now + backoff(attempts);
    let result = sqlx::query(
        r#"
        UPDATE email_queue
        SET status = 'pending',
            attempts = ?2,
            error_message = ?3,
            next_retry_at = ?4,
            updated_at = ?5
        WHERE id = ?1 AND status = 'processing'
        "#,
    )
    .bind(&entry.id)
    .bind(attempts)
    .bind(error)
    .bind(retry_at)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(FailureOutcome::Stale);
    }
    Ok(FailureOutcome::Scheduled { retry_at })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_table_then_default() {
        assert_eq!(backoff(1), chrono::Duration::minutes(5));
        assert_eq!(backoff(2), chrono::Duration::minutes(15));
        assert_eq!(backoff(3), chrono::Duration::minutes(30));
        assert_eq!(backoff(4), chrono::Duration::minutes(60));
        assert_eq!(backoff(9), chrono::Duration::minutes(60));
    }

    #[test]
    fn backoff_clamps_nonpositive_attempts() {
        assert_eq!(backoff(0), chrono::Duration::minutes(5));
        assert_eq!(backoff(-3), chrono::Duration::minutes(5));
    }

    #[test]
    fn terminal_statuses() {
        assert!(EmailStatus::Sent.is_terminal());
        assert!(EmailStatus::Failed.is_terminal());
        assert!(EmailStatus::Cancelled.is_terminal());
        assert!(!EmailStatus::Pending.is_terminal());
        assert!(!EmailStatus::Processing.is_terminal());
    }
}
