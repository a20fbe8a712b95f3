//! Face-recognition service client.
//!
//! Every camera carries its own FRS base URL (`cameras.frs`); requests go to
//! `{frs}/api/bestQuality` and `{frs}/api/motionDetection` with the shared
//! bearer token. FRS indexes frames by local wall-clock time, so lookups by
//! time are sent in the configured offset.

use super::{BestQuality, Camera, FaceRecognition, GatewayError, GatewayResult};
use crate::event::FaceRegion;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct BestQualityResponse {
    #[serde(default)]
    data: Option<BestQualityFrame>,
}

#[derive(Debug, Deserialize)]
struct BestQualityFrame {
    screenshot: String,
    #[serde(default)]
    left: i32,
    #[serde(default)]
    top: i32,
    #[serde(default)]
    width: i32,
    #[serde(default)]
    height: i32,
}

/// [`FaceRecognition`] over the FRS HTTP API.
#[derive(Debug, Clone)]
pub struct FrsClient {
    client: Client,
    token: Option<String>,
    timeout: Duration,
    utc_offset: FixedOffset,
}

impl FrsClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
            utc_offset: Utc.fix(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    async fn post(&self, endpoint: &str, method: &str, body: &Value) -> GatewayResult<reqwest::Response> {
        let url = format!("{}/api/{}", endpoint.trim_end_matches('/'), method);
        let mut request = self.client.post(&url).timeout(self.timeout).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn best_quality(&self, camera: &Camera, body: Value) -> GatewayResult<Option<BestQuality>> {
        let Some(endpoint) = camera.frs_endpoint() else {
            return Ok(None);
        };

        let response = self.post(endpoint, "bestQuality", &body).await?;
        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!(camera_id = camera.camera_id, "FRS has no best frame");
                Ok(None)
            }
            StatusCode::OK => {
                let parsed: BestQualityResponse = response.json().await?;
                Ok(parsed.data.map(|frame| BestQuality {
                    screenshot_url: frame.screenshot,
                    face: FaceRegion {
                        left: frame.left,
                        top: frame.top,
                        width: frame.width,
                        height: frame.height,
                    },
                }))
            }
            status => {
                warn!(camera_id = camera.camera_id, status = %status, "FRS bestQuality failed");
                Err(GatewayError::Status {
                    service: "frs",
                    status: status.as_u16(),
                })
            }
        }
    }
}

impl Default for FrsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FaceRecognition for FrsClient {
    async fn best_quality_by_time(
        &self,
        camera: &Camera,
        at: DateTime<Utc>,
    ) -> GatewayResult<Option<BestQuality>> {
        let body = json!({
            "streamId": camera.camera_id,
            "date": at
                .with_timezone(&self.utc_offset)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        });
        self.best_quality(camera, body).await
    }

    async fn best_quality_by_event(
        &self,
        camera: &Camera,
        event_id: &str,
    ) -> GatewayResult<Option<BestQuality>> {
        let body = json!({
            "streamId": camera.camera_id,
            "eventId": event_id,
        });
        self.best_quality(camera, body).await
    }

    async fn motion_signal(&self, camera: &Camera, active: bool) -> GatewayResult<()> {
        let Some(endpoint) = camera.frs_endpoint() else {
            return Ok(());
        };

        let body = json!({
            "streamId": camera.camera_id,
            "start": if active { "t" } else { "f" },
        });
        let response = self.post(endpoint, "motionDetection", &body).await?;
        let status = response.status();
        if status.is_success() {
            debug!(camera_id = camera.camera_id, active = active, "Motion signal sent");
            Ok(())
        } else {
            Err(GatewayError::Status {
                service: "frs",
                status: status.as_u16(),
            })
        }
    }
}
