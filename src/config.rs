use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::queue::SenderDefaults;
use crate::worker::DispatcherConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub from_email: String,
    pub from_name: String,
    pub poll_interval_ms: u64,
    pub claim_batch_size: i64,
    pub send_delay_ms: u64,
    pub lease_timeout_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // pulls from OS env; .env will be loaded in main
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is missing")?;
        let provider_base_url =
            std::env::var("PROVIDER_BASE_URL").context("PROVIDER_BASE_URL is missing")?;
        let provider_api_key =
            std::env::var("PROVIDER_API_KEY").context("PROVIDER_API_KEY is missing")?;

        let from_email = std::env::var("FROM_EMAIL").context("FROM_EMAIL is missing")?;
        let from_name =
            std::env::var("FROM_NAME").unwrap_or_else(|_| "Course Platform".to_string());

        // Claim batch size and inter-send delay are deliberately independent
        // knobs; together they set the effective provider send rate.
        let poll_interval_ms = env_u64("POLL_INTERVAL_MS", 60_000)?;
        let claim_batch_size = env_i64("CLAIM_BATCH_SIZE", 1)?;
        let send_delay_ms = env_u64("SEND_DELAY_MS", 10_000)?;
        let lease_timeout_secs = env_i64("LEASE_TIMEOUT_SECS", 300)?;

        if claim_batch_size < 1 {
            return Err(anyhow!("CLAIM_BATCH_SIZE must be at least 1"));
        }

        Ok(Self {
            database_url,
            provider_base_url,
            provider_api_key,
            from_email,
            from_name,
            poll_interval_ms,
            claim_batch_size,
            send_delay_ms,
            lease_timeout_secs,
        })
    }

    pub fn sender_defaults(&self) -> SenderDefaults {
        SenderDefaults {
            from_email: self.from_email.clone(),
            from_name: self.from_name.clone(),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            claim_batch_size: self.claim_batch_size,
            send_delay: Duration::from_millis(self.send_delay_ms),
            lease_timeout: chrono::Duration::seconds(self.lease_timeout_secs),
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("{key} must be a valid u64: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("{key} must be a valid i64: {e}")),
        Err(_) => Ok(default),
    }
}
