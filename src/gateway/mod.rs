//! Gateways to the services doorwatch talks to.
//!
//! Each collaborator sits behind an async trait so the session manager and
//! the correlator can be driven by in-memory fakes in tests:
//!
//! ```text
//! Directory         facility lookups (Postgres)         postgres::PgDirectory
//! BlobStore         screenshot persistence (S3)         blob::S3BlobStore
//! AnalyticsStore    append-only records (ClickHouse)    clickhouse::ClickhouseStore
//! FaceRecognition   best frame, motion signal (FRS)     frs::FrsClient
//! ImageSource       camera snapshots, URL downloads     camera::HttpImageSource
//! PushGateway       mobile notifications                push::PushClient
//! ```
//!
//! Lookups return `Ok(None)` or an empty `Vec` for "not found"; `Err` is
//! reserved for the collaborator itself failing.

pub mod blob;
pub mod camera;
pub mod clickhouse;
pub mod frs;
pub mod postgres;
pub mod push;

use crate::event::{DoorSide, FaceRegion};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;

pub use blob::S3BlobStore;
pub use camera::HttpImageSource;
pub use clickhouse::ClickhouseStore;
pub use frs::FrsClient;
pub use postgres::PgDirectory;
pub use push::PushClient;

/// Screenshot retention in the blob store (24 * 30 * 6 hours).
pub const SCREENSHOT_TTL_HOURS: i64 = 24 * 30 * 6;

/// Errors raised by gateway implementations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote answered with a status it should not have
    #[error("{service} returned status {status}")]
    Status { service: &'static str, status: u16 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Failed(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// An intercom unit (`houses_domophones`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Domophone {
    pub house_domophone_id: i32,
    pub enabled: i32,
    pub model: String,
    pub ip: Option<String>,
    pub name: Option<String>,
}

/// A building entry served by one domophone output (`houses_entrances`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Entrance {
    pub house_entrance_id: i32,
    pub entrance: String,
    pub camera_id: Option<i32>,
    pub house_domophone_id: i32,
    pub domophone_output: Option<i32>,
    /// From `houses_houses_entrances`, absent for unlinked entrances
    pub address_house_id: Option<i32>,
}

/// A video camera (`cameras`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Camera {
    pub camera_id: i32,
    pub enabled: i32,
    pub url: String,
    pub frs: Option<String>,
    pub ip: Option<String>,
    pub name: Option<String>,
}

impl Camera {
    /// Face-recognition base URL, if FRS is enabled for this camera.
    pub fn frs_endpoint(&self) -> Option<&str> {
        self.frs
            .as_deref()
            .map(str::trim)
            .filter(|frs| !frs.is_empty() && *frs != "-")
    }
}

/// A push subscription on a flat (`houses_watchers`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Watcher {
    pub house_watcher_id: i32,
    pub subscriber_device_id: i32,
    pub house_flat_id: i32,
    pub event_type: String,
    pub event_detail: Option<String>,
    pub comments: Option<String>,
}

/// A subscriber's phone (`houses_subscribers_devices`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MobileDevice {
    pub subscriber_device_id: i32,
    pub push_token: Option<String>,
    pub push_token_type: i32,
    pub platform: i32,
}

/// A house address (`addresses_houses`).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct House {
    pub address_house_id: i32,
    pub house_full: String,
}

/// Facility directory lookups.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn domophone_by_ip(&self, ip: &str) -> GatewayResult<Option<Domophone>>;

    async fn domophone_by_id(&self, domophone_id: i32) -> GatewayResult<Option<Domophone>>;

    async fn entrance(
        &self,
        domophone_id: i32,
        side: DoorSide,
    ) -> GatewayResult<Option<Entrance>>;

    async fn camera(&self, camera_id: i32) -> GatewayResult<Option<Camera>>;

    async fn camera_by_ip(&self, ip: &str) -> GatewayResult<Option<Camera>>;

    async fn flats_by_rfid(&self, key: &str) -> GatewayResult<Vec<i32>>;

    async fn flats_by_code(&self, code: &str) -> GatewayResult<Vec<i32>>;

    async fn flat_by_apartment(
        &self,
        apartment: i32,
        domophone_id: i32,
    ) -> GatewayResult<Option<i32>>;

    async fn flats_by_face_id(&self, face_id: &str, entrance_id: i32) -> GatewayResult<Vec<i32>>;

    async fn flats_by_phone(&self, domophone_id: i32, phone: &str) -> GatewayResult<Vec<i32>>;

    async fn watchers(&self, flat_id: i32) -> GatewayResult<Vec<Watcher>>;

    async fn mobile_device(&self, device_id: i32) -> GatewayResult<Option<MobileDevice>>;

    async fn house_by_entrance(&self, entrance_id: i32) -> GatewayResult<Option<House>>;

    async fn touch_rfid_last_seen(&self, key: &str, at: DateTime<Utc>) -> GatewayResult<()>;
}

/// Metadata stored alongside a blob.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobMetadata {
    pub content_type: String,
    /// Unix seconds after which the blob may be collected
    pub expire: i64,
    pub labels: Vec<(String, String)>,
}

impl BlobMetadata {
    /// JPEG screenshot metadata expiring [`SCREENSHOT_TTL_HOURS`] after `at`.
    pub fn screenshot(at: DateTime<Utc>) -> Self {
        Self {
            content_type: "image/jpeg".to_string(),
            expire: (at + ChronoDuration::hours(SCREENSHOT_TTL_HOURS)).timestamp(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.labels.push((key.into(), value.to_string()));
        self
    }
}

/// Screenshot persistence.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return the reference recorded on events.
    async fn save(&self, name: &str, metadata: &BlobMetadata, bytes: Vec<u8>) -> GatewayResult<String>;
}

/// Analytics tables doorwatch appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsTable {
    /// Raw audit trail of every non-spam line
    Syslog,
    /// Enriched access events
    Plog,
}

impl AnalyticsTable {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyticsTable::Syslog => "syslog",
            AnalyticsTable::Plog => "plog",
        }
    }
}

/// Append-only analytics sink.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Insert `rows` as one batch: either all of them land or none do.
    async fn append(&self, table: AnalyticsTable, rows: Vec<Value>) -> GatewayResult<()>;
}

/// Best frame selected by the face-recognition service.
#[derive(Debug, Clone, PartialEq)]
pub struct BestQuality {
    pub screenshot_url: String,
    pub face: FaceRegion,
}

/// Face-recognition service. Cameras without an FRS endpoint yield `None`
/// and ignore motion signals.
#[async_trait]
pub trait FaceRecognition: Send + Sync {
    async fn best_quality_by_time(
        &self,
        camera: &Camera,
        at: DateTime<Utc>,
    ) -> GatewayResult<Option<BestQuality>>;

    async fn best_quality_by_event(
        &self,
        camera: &Camera,
        event_id: &str,
    ) -> GatewayResult<Option<BestQuality>>;

    async fn motion_signal(&self, camera: &Camera, active: bool) -> GatewayResult<()>;
}

/// Image fetching: live camera snapshots and arbitrary screenshot URLs.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn snapshot(&self, camera: &Camera) -> GatewayResult<Vec<u8>>;

    async fn download(&self, url: &str) -> GatewayResult<Vec<u8>>;
}

/// One mobile push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub hash: String,
    pub title: String,
    pub body: String,
    pub device_token: String,
    pub token_type: i32,
    pub platform: i32,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, message: &PushMessage) -> GatewayResult<()>;
}

/// Shared handles to every collaborator.
#[derive(Clone)]
pub struct Gateways {
    pub directory: Arc<dyn Directory>,
    pub blobs: Arc<dyn BlobStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub frs: Arc<dyn FaceRecognition>,
    pub images: Arc<dyn ImageSource>,
    pub push: Arc<dyn PushGateway>,
}
