//! Push notification gateway client.
//!
//! The gateway is a single GET endpoint; a delivery is accepted when it
//! answers `200` with the literal body `success`.

use super::{GatewayError, GatewayResult, PushGateway, PushMessage};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification lifetime on the device side.
const DEFAULT_TTL_SECS: u64 = 30;

/// [`PushGateway`] over HTTP.
#[derive(Debug, Clone)]
pub struct PushClient {
    client: Client,
    url: String,
    secret: String,
    ttl_secs: u64,
    timeout: Duration,
}

impl PushClient {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            secret: secret.into(),
            ttl_secs: DEFAULT_TTL_SECS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Notification hash: md5 over the flat id and event time.
pub fn notification_hash(flat_id: i32, timestamp: i64) -> String {
    format!("{:x}", md5::compute(format!("{flat_id}{timestamp}")))
}

#[async_trait]
impl PushGateway for PushClient {
    async fn send(&self, message: &PushMessage) -> GatewayResult<()> {
        let timestamp = Utc::now().timestamp().to_string();
        let ttl = self.ttl_secs.to_string();
        let token_type = message.token_type.to_string();
        let platform = message.platform.to_string();

        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .query(&[
                ("action", "push"),
                ("secret", self.secret.as_str()),
                ("token", message.device_token.as_str()),
                ("type", token_type.as_str()),
                ("timestamp", timestamp.as_str()),
                ("ttl", ttl.as_str()),
                ("platform", platform.as_str()),
                ("title", message.title.as_str()),
                ("msg", message.body.as_str()),
                ("sound", "default"),
                ("pushAction", "paranoid"),
                ("hash", message.hash.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() && body.trim() == "success" {
            debug!(hash = %message.hash, platform = message.platform, "Push delivered");
            return Ok(());
        }

        warn!(status = %status, body = %body, "Push gateway rejected notification");
        if status.is_success() {
            Err(GatewayError::Failed(format!("push gateway answered '{}'", body.trim())))
        } else {
            Err(GatewayError::Status {
                service: "push",
                status: status.as_u16(),
            })
        }
    }
}
