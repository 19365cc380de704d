//! Read-only aggregation and batch administration over the job store, plus
//! the retention sweep. None of this runs in the dispatcher's hot path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::Result;

#[derive(Debug, Default, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchStatus {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub progress_percent: i64,
}

/// Global snapshot of row counts by status.
pub async fn queue_stats(pool: &SqlitePool) -> Result<QueueStats> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM email_queue GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut stats = QueueStats::default();
    for (status, count) in rows {
        match status.as_str() {
            "pending" => stats.pending = count,
            "processing" => stats.processing = count,
            "sent" => stats.sent = count,
            "failed" => stats.failed = count,
            "cancelled" => stats.cancelled = count,
            other => tracing::warn!(status = %other, "unknown status in queue stats"),
        }
    }
    Ok(stats)
}

pub async fn batch_status(pool: &SqlitePool, batch_id: &str) -> Result<BatchStatus> {
    let (total, pending, processing, sent, failed, cancelled): (i64, i64, i64, i64, i64, i64) =
        sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'processing'), 0),
                COALESCE(SUM(status = 'sent'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'cancelled'), 0)
            FROM email_queue
            WHERE batch_id = ?
            "#,
        )
        .bind(batch_id)
        .fetch_one(pool)
        .await?;

    Ok(BatchStatus {
        total,
        pending,
        processing,
        sent,
        failed,
        cancelled,
        progress_percent: progress_percent(sent, failed, total),
    })
}

fn progress_percent(sent: i64, failed: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    (100.0 * (sent + failed) as f64 / total as f64).round() as i64
}

/// Cancel the not-yet-started jobs of a batch. Rows already claimed, sent or
/// failed are untouched; nothing ever transitions out of those states here.
pub async fn cancel_batch(pool: &SqlitePool, batch_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE email_queue
        SET status = 'cancelled',
            next_retry_at = NULL,
            updated_at = ?2
        WHERE batch_id = ?1 AND status = 'pending'
        "#,
    )
    .bind(batch_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Reset a batch's failed rows for a fresh round of attempts.
pub async fn retry_failed_in_batch(pool: &SqlitePool, batch_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE email_queue
        SET status = 'pending',
            attempts = 0,
            error_message = NULL,
            next_retry_at = NULL,
            updated_at = ?2
        WHERE batch_id = ?1 AND status = 'failed'
        "#,
    )
    .bind(batch_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Delete terminal rows older than the retention window.
///
/// Failed rows are kept so operators can inspect and retry them; they are
/// only removed through an explicit reset or a separate purge.
pub async fn cleanup(pool: &SqlitePool, now: DateTime<Utc>, days_to_keep: i64) -> Result<u64> {
    let cutoff = now - chrono::Duration::days(days_to_keep);
    let result = sqlx::query(
        r#"
        DELETE FROM email_queue
        WHERE status IN ('sent', 'cancelled')
          AND created_at < ?
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::progress_percent;

    #[test]
    fn progress_rounds_and_handles_empty() {
        assert_eq!(progress_percent(0, 0, 0), 0);
        assert_eq!(progress_percent(0, 0, 3), 0);
        assert_eq!(progress_percent(1, 0, 3), 33);
        assert_eq!(progress_percent(1, 1, 3), 67);
        assert_eq!(progress_percent(2, 1, 3), 100);
    }
}
