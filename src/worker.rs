//! The dispatcher: a periodic loop that recovers expired leases, claims a
//! bounded number of ready jobs and sends them sequentially through the
//! provider with an enforced inter-send delay.
//!
//! Cross-worker safety is delegated entirely to the store's atomic claim;
//! running several dispatchers against the same store is safe. Within one
//! dispatcher the loop is sequential by design, so the fixed delay between
//! sends throttles provider throughput.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::provider::{OutboundEmail, ProviderClient, ProviderReceipt, TemplatedEmail};
use crate::queue::{self, FailureOutcome, QueueEntry};
use crate::Result;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub claim_batch_size: i64,
    pub send_delay: Duration,
    pub lease_timeout: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            claim_batch_size: 1,
            send_delay: Duration::from_secs(10),
            lease_timeout: chrono::Duration::minutes(5),
        }
    }
}

/// Owns the recurring tick schedule. Constructing several independent
/// dispatchers (e.g. in tests) is fine; there is no process-global state.
pub struct Dispatcher {
    pool: SqlitePool,
    provider: Arc<dyn ProviderClient>,
    cfg: DispatcherConfig,
    handle: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, provider: Arc<dyn ProviderClient>, cfg: DispatcherConfig) -> Self {
        Self {
            pool,
            provider,
            cfg,
            handle: None,
            shutdown: None,
        }
    }

    /// Start the recurring tick loop. Idempotent: a no-op while running.
    /// The first tick fires immediately, then every poll interval.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            tracing::debug!("dispatcher already running");
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let pool = self.pool.clone();
        let provider = self.provider.clone();
        let cfg = self.cfg.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A failing tick must not kill the loop.
                        if let Err(e) = run_tick(&pool, provider.as_ref(), &cfg).await {
                            tracing::error!(error = %e, "dispatcher tick failed");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });

        self.shutdown = Some(tx);
        self.handle = Some(handle);
        tracing::info!(
            poll_interval_ms = self.cfg.poll_interval.as_millis() as u64,
            claim_batch_size = self.cfg.claim_batch_size,
            "dispatcher started"
        );
    }

    /// Cancel the recurring schedule. An in-flight tick finishes first.
    pub async fn stop(&mut self) {
        let (Some(tx), Some(handle)) = (self.shutdown.take(), self.handle.take()) else {
            return;
        };
        let _ = tx.send(true);
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "dispatcher task join failed");
        }
        tracing::info!("dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Run one tick inline. Used by tests and on-demand draining.
    pub async fn tick(&self) -> Result<usize> {
        run_tick(&self.pool, self.provider.as_ref(), &self.cfg).await
    }
}

/// One tick: lease recovery, claim, then the sequential send loop.
pub async fn run_tick(
    pool: &SqlitePool,
    provider: &dyn ProviderClient,
    cfg: &DispatcherConfig,
) -> Result<usize> {
    let now = Utc::now();

    let recovered = queue::recover_abandoned(pool, now, cfg.lease_timeout).await?;
    if recovered > 0 {
        tracing::warn!(recovered, "recovered jobs from expired leases");
    }

    let claimed = queue::claim_ready(pool, now, cfg.claim_batch_size).await?;
    if claimed.is_empty() {
        return Ok(0);
    }

    tracing::info!(count = claimed.len(), "claimed jobs");

    for (i, entry) in claimed.iter().enumerate() {
        process_job(pool, provider, entry).await;
        if i + 1 < claimed.len() {
            // Deliberate provider throttle, not a performance knob.
            tokio::time::sleep(cfg.send_delay).await;
        }
    }

    Ok(claimed.len())
}

/// Send one claimed job and record the outcome.
///
/// Never propagates a send failure: one job's failure must not abort the
/// tick or affect sibling jobs. Storage errors while recording are logged
/// and left for lease recovery to repair.
async fn process_job(pool: &SqlitePool, provider: &dyn ProviderClient, entry: &QueueEntry) {
    let result = dispatch_send(provider, entry).await;
    let now = Utc::now();

    match result {
        Ok(receipt) => {
            match queue::record_sent(pool, &entry.id, &receipt.id, now).await {
                Ok(true) => {
                    tracing::info!(
                        job_id = %entry.id,
                        provider_message_id = %receipt.id,
                        attempt = entry.attempts + 1,
                        "email sent"
                    );
                    if let Err(e) =
                        mirror_campaign(pool, entry, "sent", Some(&receipt.id), None, now).await
                    {
                        tracing::error!(job_id = %entry.id, error = %e, "failed to mirror campaign log");
                    }
                }
                Ok(false) => {
                    // Lease recovered mid-send; the row was resolved by
                    // another worker and its record stands.
                    tracing::warn!(job_id = %entry.id, "claim lost before outcome was recorded");
                }
                Err(e) => {
                    tracing::error!(job_id = %entry.id, error = %e, "failed to record sent status");
                }
            }
        }
        Err(reason) => {
            match queue::record_failure(pool, entry, &reason, now).await {
                Ok(FailureOutcome::Scheduled { retry_at }) => {
                    tracing::warn!(
                        job_id = %entry.id,
                        attempt = entry.attempts + 1,
                        error = %reason,
                        retry_at = %retry_at,
                        "send failed, retry scheduled"
                    );
                }
                Ok(FailureOutcome::Stale) => {
                    tracing::warn!(job_id = %entry.id, "claim lost before outcome was recorded");
                }
                Ok(FailureOutcome::Exhausted) => {
                    tracing::error!(
                        job_id = %entry.id,
                        attempts = entry.attempts + 1,
                        error = %reason,
                        "send failed permanently"
                    );
                    if let Err(e) =
                        mirror_campaign(pool, entry, "failed", None, Some(&reason), now).await
                    {
                        tracing::error!(job_id = %entry.id, error = %e, "failed to mirror campaign log");
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %entry.id, error = %e, "failed to record failure");
                }
            }
        }
    }
}

/// Templated vs plain send, selected by the presence of template_id.
async fn dispatch_send(
    provider: &dyn ProviderClient,
    entry: &QueueEntry,
) -> std::result::Result<ProviderReceipt, String> {
    let outcome = if let Some(template_id) = entry.template_id.as_deref() {
        let template_data = match entry.template_data.as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| format!("invalid template_data: {e}"))?,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        provider
            .send_template(&TemplatedEmail {
                to_email: &entry.recipient_email,
                to_name: entry.recipient_name.as_deref(),
                from_email: &entry.from_email,
                from_name: &entry.from_name,
                subject: Some(&entry.subject),
                template_id,
                template_data,
            })
            .await
    } else {
        provider
            .send(&OutboundEmail {
                to_email: &entry.recipient_email,
                to_name: entry.recipient_name.as_deref(),
                from_email: &entry.from_email,
                from_name: &entry.from_name,
                subject: &entry.subject,
                html: entry.html_content.as_deref(),
                text: entry.text_content.as_deref(),
            })
            .await
    };

    outcome.map_err(|e| e.message)
}

/// Upsert the terminal outcome of a campaign-linked job into the campaign
/// log so the campaign tables see it without polling the queue.
async fn mirror_campaign(
    pool: &SqlitePool,
    entry: &QueueEntry,
    status: &str,
    provider_message_id: Option<&str>,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(campaign_id) = entry.campaign_id.as_deref() else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO campaign_log (
            id, campaign_id, email_id, user_id, recipient_email,
            status, provider_message_id, error_message, logged_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (campaign_id, email_id) DO UPDATE SET
            status = excluded.status,
            provider_message_id = excluded.provider_message_id,
            error_message = excluded.error_message,
            logged_at = excluded.logged_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(campaign_id)
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(&entry.recipient_email)
    .bind(status)
    .bind(provider_message_id)
    .bind(error_message)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
