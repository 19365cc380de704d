//! Thin client for the external transactional-email HTTP API.
//!
//! The queue treats the provider as a black box with two outcomes: a
//! provider-assigned message id, or a failure with a reason. Retry policy
//! lives in the queue, not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderReceipt {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail<'a> {
    pub to_email: &'a str,
    pub to_name: Option<&'a str>,
    pub from_email: &'a str,
    pub from_name: &'a str,
    pub subject: &'a str,
    pub html: Option<&'a str>,
    pub text: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplatedEmail<'a> {
    pub to_email: &'a str,
    pub to_name: Option<&'a str>,
    pub from_email: &'a str,
    pub from_name: &'a str,
    pub subject: Option<&'a str>,
    pub template_id: &'a str,
    pub template_data: serde_json::Value,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, msg: &OutboundEmail<'_>) -> Result<ProviderReceipt, ProviderError>;
    async fn send_template(
        &self,
        msg: &TemplatedEmail<'_>,
    ) -> Result<ProviderReceipt, ProviderError>;
}

/// reqwest-backed client for the provider's JSON API.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post_email<B: Serialize>(&self, body: &B) -> Result<ProviderReceipt, ProviderError> {
        let url = format!("{}/emails", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("provider request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(format!(
                "provider returned {status}: {detail}"
            )));
        }

        resp.json::<ProviderReceipt>()
            .await
            .map_err(|e| ProviderError::new(format!("invalid provider response: {e}")))
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn send(&self, msg: &OutboundEmail<'_>) -> Result<ProviderReceipt, ProviderError> {
        self.post_email(msg).await
    }

    async fn send_template(
        &self,
        msg: &TemplatedEmail<'_>,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.post_email(msg).await
    }
}
