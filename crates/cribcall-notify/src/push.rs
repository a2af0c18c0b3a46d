//! Push relay client.
//!
//! One HTTPS POST per batch of up to 500 tokens, with a 10 s deadline.
//! 5xx gets exactly one retry after 1 s; 4xx is permanent. Tokens the relay
//! reports invalid are handed back for registry pruning.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_TOKENS_PER_REQUEST: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub monitor_id: String,
    pub monitor_name: String,
    pub timestamp: u64,
    pub peak_level: f32,
    pub subscription_id: String,
    pub fcm_token: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushResponse {
    pub success: u32,
    pub failure: u32,
    pub invalid_tokens: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push relay returned status {0}")]
    Status(u16),

    #[error("push request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct PushRelaySender {
    client: reqwest::Client,
    url: String,
}

impl PushRelaySender {
    pub fn new(url: impl Into<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn send(&self, request: &PushRequest) -> Result<PushResponse, PushError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let resp = self.client.post(&self.url).json(request).send().await?;
            let status = resp.status();

            if status.is_success() {
                let parsed: PushResponse = resp.json().await?;
                debug!(
                    "[push] Relay accepted batch: {} ok, {} failed, {} invalid",
                    parsed.success,
                    parsed.failure,
                    parsed.invalid_tokens.len()
                );
                return Ok(parsed);
            }
            if status.is_server_error() && attempt == 1 {
                warn!("[push] Relay returned {}; retrying once", status);
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }
            return Err(PushError::Status(status.as_u16()));
        }
    }
}
