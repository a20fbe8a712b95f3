//! Screenshot downloads.
//!
//! Live snapshots come from the backend's internal camshot endpoint
//! (`{internal_api}/frs/camshot/{camera_id}`); FRS frames are plain URLs.

use super::{Camera, GatewayError, GatewayResult, ImageSource};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`ImageSource`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    client: Client,
    internal_api: String,
    timeout: Duration,
}

impl HttpImageSource {
    pub fn new(internal_api: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            internal_api: internal_api.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn snapshot_url(&self, camera_id: i32) -> String {
        format!("{}/frs/camshot/{}", self.internal_api, camera_id)
    }

    async fn fetch(&self, url: &str) -> GatewayResult<Vec<u8>> {
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                service: "camshot",
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(GatewayError::Failed(format!("empty image from {url}")));
        }

        debug!(url = %url, size = bytes.len(), "Image downloaded");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn snapshot(&self, camera: &Camera) -> GatewayResult<Vec<u8>> {
        self.fetch(&self.snapshot_url(camera.camera_id)).await
    }

    async fn download(&self, url: &str) -> GatewayResult<Vec<u8>> {
        self.fetch(url).await
    }
}
