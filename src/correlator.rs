//! Door event correlation.
//!
//! Turns a single-shot event into enriched [`PlogRecord`]s:
//!
//! ```text
//! domophone (by ip or id)
//!   -> entrance (domophone, door side)
//!   -> camera (when the entrance has one)
//!   -> screenshot (camera default, FRS override, blob store)
//!   -> flats (by RFID key, code, phone or face)
//!   -> one plog row per flat
//! ```
//!
//! Syslog events enter through [`Correlator::correlate`], canonical stream
//! events through [`Correlator::correlate_door_event`]. Resolution failures
//! before the flat lookup abort the event; screenshot failures only drop
//! the image.

use crate::enrich::{Enricher, FrameLookup, Preview};
use crate::event::{ClassifiedEvent, DomophoneDescriptor, DoorEvent, DoorSide, EventKind, PlogRecord};
use crate::gateway::push::notification_hash;
use crate::gateway::{
    AnalyticsTable, BlobMetadata, Camera, Directory, Domophone, Entrance, GatewayError, Gateways,
    PushMessage,
};
use crate::queue::{DoorEventHandler, HandleResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

const PUSH_TITLE: &str = "Door opened";

#[derive(Error, Debug)]
pub enum CorrelateError {
    /// A directory lookup found nothing
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// A collaborator failed while resolving
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("failed to persist record: {0}")]
    Persistence(#[source] GatewayError),

    #[error("unsupported event type {0}")]
    Unsupported(i32),

    #[error("malformed event detail: {0}")]
    MalformedDetail(String),
}

impl CorrelateError {
    /// Whether retrying the same input can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CorrelateError::Unsupported(_) | CorrelateError::MalformedDetail(_)
        )
    }
}

/// What happened to a correlated event.
#[derive(Debug)]
pub enum Outcome {
    /// Rows appended to the `plog` table, one per flat
    Recorded(Vec<PlogRecord>),
    /// A motion signal was forwarded to FRS
    Signalled,
    /// Nothing to record
    Skipped(&'static str),
}

/// A resolved domophone with the entrance and camera behind one door.
#[derive(Debug, Clone)]
pub struct Site {
    pub domophone: Domophone,
    pub entrance: Entrance,
    pub camera: Option<Camera>,
    pub side: DoorSide,
}

impl Site {
    pub async fn by_ip(
        directory: &dyn Directory,
        ip: &str,
        side: DoorSide,
    ) -> Result<Self, CorrelateError> {
        let domophone = directory
            .domophone_by_ip(ip)
            .await?
            .ok_or_else(|| CorrelateError::Resolution(format!("no domophone with ip {ip}")))?;
        Self::for_domophone(directory, domophone, side).await
    }

    pub async fn for_domophone(
        directory: &dyn Directory,
        domophone: Domophone,
        side: DoorSide,
    ) -> Result<Self, CorrelateError> {
        let entrance = directory
            .entrance(domophone.house_domophone_id, side)
            .await?
            .ok_or_else(|| {
                CorrelateError::Resolution(format!(
                    "no entrance on domophone {} output {}",
                    domophone.house_domophone_id,
                    side.output()
                ))
            })?;

        let camera = match entrance.camera_id {
            Some(camera_id) => Some(directory.camera(camera_id).await?.ok_or_else(|| {
                CorrelateError::Resolution(format!("camera {camera_id} not found"))
            })?),
            None => None,
        };

        Ok(Self {
            domophone,
            entrance,
            camera,
            side,
        })
    }

    pub fn descriptor(&self) -> DomophoneDescriptor {
        DomophoneDescriptor {
            camera_id: self.camera.as_ref().map(|c| c.camera_id),
            domophone_description: self.entrance.entrance.clone(),
            domophone_id: self.domophone.house_domophone_id,
            domophone_output: self
                .entrance
                .domophone_output
                .unwrap_or_else(|| self.side.output()),
            entrance_id: self.entrance.house_entrance_id,
            house_id: self.entrance.address_house_id,
        }
    }
}

/// Correlates single-shot events against the directory.
#[derive(Clone)]
pub struct Correlator {
    gateways: Gateways,
    enricher: Enricher,
}

impl Correlator {
    pub fn new(gateways: Gateways) -> Self {
        let enricher = Enricher::new(gateways.clone());
        Self { gateways, enricher }
    }

    /// Correlate an event classified from a syslog line sent by `host`.
    pub async fn correlate(
        &self,
        event: &ClassifiedEvent,
        host: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<Outcome, CorrelateError> {
        let ip = host.to_string();
        let directory = self.gateways.directory.as_ref();

        match event {
            ClassifiedEvent::Motion { active } => self.motion(&ip, *active).await,
            ClassifiedEvent::OpenByCode { code } => {
                let site = Site::by_ip(directory, &ip, event.door_side()).await?;
                self.open_by_code(&site, &code.to_string(), at).await
            }
            ClassifiedEvent::OpenByRfid { key, .. } => {
                let site = Site::by_ip(directory, &ip, event.door_side()).await?;
                self.open_by_rfid(&site, key, at).await
            }
            ClassifiedEvent::OpenByButton { side } => {
                let site = Site::by_ip(directory, &ip, *side).await?;
                info!(
                    domophone_id = site.domophone.house_domophone_id,
                    entrance_id = site.entrance.house_entrance_id,
                    "Door opened by button, no flat addressed"
                );
                Ok(Outcome::Skipped("no flat addressed"))
            }
            other => {
                debug!(event = other.name(), "Not a single-shot event");
                Ok(Outcome::Skipped("not a single-shot event"))
            }
        }
    }

    /// Correlate a canonical event consumed from the stream.
    pub async fn correlate_door_event(&self, event: &DoorEvent) -> Result<Outcome, CorrelateError> {
        let kind = event
            .kind()
            .ok_or(CorrelateError::Unsupported(event.event_type))?;
        let at = event.timestamp();
        let detail = event.detail.trim();

        if !matches!(
            kind,
            EventKind::OpenedByKey
                | EventKind::OpenedByApp
                | EventKind::OpenedByFace
                | EventKind::OpenedByCode
        ) {
            return Err(CorrelateError::Unsupported(kind.code()));
        }
        if detail.is_empty() {
            return Err(CorrelateError::MalformedDetail(format!(
                "event type {} requires a detail",
                kind.code()
            )));
        }

        let face = match kind {
            EventKind::OpenedByFace => Some(split_face_detail(detail)?),
            _ => None,
        };

        let directory = self.gateways.directory.as_ref();
        let domophone = match event.domophone_id {
            Some(id) => directory.domophone_by_id(id).await?.ok_or_else(|| {
                CorrelateError::Resolution(format!("domophone {id} not found"))
            })?,
            None => directory.domophone_by_ip(&event.ip).await?.ok_or_else(|| {
                CorrelateError::Resolution(format!("no domophone with ip {}", event.ip))
            })?,
        };
        let site = Site::for_domophone(directory, domophone, event.door_side()).await?;

        match (kind, face) {
            (EventKind::OpenedByFace, Some((face_id, frs_event_id))) => {
                self.open_by_face(&site, face_id, frs_event_id, at).await
            }
            (EventKind::OpenedByKey, _) => self.open_by_rfid(&site, detail, at).await,
            (EventKind::OpenedByApp, _) => self.open_by_app(&site, detail, at).await,
            _ => self.open_by_code(&site, detail, at).await,
        }
    }

    async fn motion(&self, ip: &str, active: bool) -> Result<Outcome, CorrelateError> {
        let Some(camera) = self.gateways.directory.camera_by_ip(ip).await? else {
            debug!(ip = %ip, "Motion from unknown camera");
            return Ok(Outcome::Skipped("no camera"));
        };
        if camera.frs_endpoint().is_none() {
            return Ok(Outcome::Skipped("face recognition disabled"));
        }

        self.gateways.frs.motion_signal(&camera, active).await?;
        debug!(camera_id = camera.camera_id, active = active, "Motion forwarded");
        Ok(Outcome::Signalled)
    }

    async fn open_by_code(
        &self,
        site: &Site,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<Outcome, CorrelateError> {
        let preview = self.preview(site, FrameLookup::ByTime(at), at).await;
        let flats = self.gateways.directory.flats_by_code(code).await?;
        self.record(site, &flats, EventKind::OpenedByCode, at, &preview, |r| {
            r.with_code(code)
        })
        .await
    }

    async fn open_by_rfid(
        &self,
        site: &Site,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Outcome, CorrelateError> {
        let preview = self.preview(site, FrameLookup::ByTime(at), at).await;
        let flats = self.gateways.directory.flats_by_rfid(key).await?;

        if let Err(e) = self.gateways.directory.touch_rfid_last_seen(key, at).await {
            warn!(key = %key, error = %e, "Failed to update RFID last seen");
        }

        let outcome = self
            .record(site, &flats, EventKind::OpenedByKey, at, &preview, |r| {
                r.with_rfid(key)
            })
            .await?;

        if let Some(&flat_id) = flats.first() {
            let body = format!("Opened by key {key}");
            self.notify_watchers(flat_id, EventKind::OpenedByKey, &body, at)
                .await;
        }
        Ok(outcome)
    }

    async fn open_by_app(
        &self,
        site: &Site,
        phone: &str,
        at: DateTime<Utc>,
    ) -> Result<Outcome, CorrelateError> {
        let preview = self.preview(site, FrameLookup::ByTime(at), at).await;
        let flats = self
            .gateways
            .directory
            .flats_by_phone(site.domophone.house_domophone_id, phone)
            .await?;
        self.record(site, &flats, EventKind::OpenedByApp, at, &preview, |r| {
            r.with_phone(phone)
        })
        .await
    }

    async fn open_by_face(
        &self,
        site: &Site,
        face_id: &str,
        frs_event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Outcome, CorrelateError> {
        let entrance_id = site.entrance.house_entrance_id;
        let house = self
            .gateways
            .directory
            .house_by_entrance(entrance_id)
            .await?
            .ok_or_else(|| {
                CorrelateError::Resolution(format!("no house for entrance {entrance_id}"))
            })?;

        let preview = self
            .preview(site, FrameLookup::ByEvent(frs_event_id), at)
            .await;
        let flats = self
            .gateways
            .directory
            .flats_by_face_id(face_id, entrance_id)
            .await?;

        let outcome = self
            .record(site, &flats, EventKind::OpenedByFace, at, &preview, |r| r)
            .await?;

        if let Some(&flat_id) = flats.first() {
            let body = format!("Address: {}\nFlat: {}", house.house_full, flat_id);
            self.notify_watchers(flat_id, EventKind::OpenedByFace, &body, at)
                .await;
        }
        Ok(outcome)
    }

    async fn preview(&self, site: &Site, lookup: FrameLookup<'_>, at: DateTime<Utc>) -> Preview {
        match &site.camera {
            Some(camera) => {
                let metadata = BlobMetadata::screenshot(at)
                    .with_label("domophone_id", site.domophone.house_domophone_id);
                self.enricher.capture(camera, lookup, metadata).await
            }
            None => Preview::none(),
        }
    }

    /// Build and append one record per flat.
    async fn record<F>(
        &self,
        site: &Site,
        flats: &[i32],
        kind: EventKind,
        at: DateTime<Utc>,
        preview: &Preview,
        decorate: F,
    ) -> Result<Outcome, CorrelateError>
    where
        F: Fn(PlogRecord) -> PlogRecord,
    {
        if flats.is_empty() {
            info!(
                domophone_id = site.domophone.house_domophone_id,
                event = kind.code(),
                "No flat matched"
            );
            return Ok(Outcome::Skipped("no matching flat"));
        }

        let records: Vec<PlogRecord> = flats
            .iter()
            .map(|&flat_id| {
                decorate(
                    PlogRecord::new(kind, at, flat_id, site.descriptor()).with_image(
                        preview.image_ref.as_deref(),
                        preview.kind,
                        preview.face,
                    ),
                )
            })
            .collect();

        // every row of one event in a single batch
        let rows = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CorrelateError::Persistence(e.into()))?;
        self.gateways
            .analytics
            .append(AnalyticsTable::Plog, rows)
            .await
            .map_err(CorrelateError::Persistence)?;

        info!(
            domophone_id = site.domophone.house_domophone_id,
            entrance_id = site.entrance.house_entrance_id,
            event = kind.code(),
            flats = records.len(),
            preview = ?preview.kind,
            "Event recorded"
        );
        Ok(Outcome::Recorded(records))
    }

    /// Push to the flat's watchers subscribed to `kind`. Failures are logged.
    async fn notify_watchers(&self, flat_id: i32, kind: EventKind, body: &str, at: DateTime<Utc>) {
        let directory = &self.gateways.directory;
        let watchers = match directory.watchers(flat_id).await {
            Ok(watchers) => watchers,
            Err(e) => {
                warn!(flat_id = flat_id, error = %e, "Failed to load watchers");
                return;
            }
        };

        let event_type = kind.code().to_string();
        let hash = notification_hash(flat_id, at.timestamp());
        for watcher in watchers.iter().filter(|w| w.event_type == event_type) {
            let device = match directory.mobile_device(watcher.subscriber_device_id).await {
                Ok(Some(device)) => device,
                Ok(None) => {
                    debug!(device_id = watcher.subscriber_device_id, "Watcher device not found");
                    continue;
                }
                Err(e) => {
                    warn!(device_id = watcher.subscriber_device_id, error = %e, "Failed to load device");
                    continue;
                }
            };
            let Some(token) = device.push_token.filter(|t| !t.is_empty()) else {
                continue;
            };

            let message = PushMessage {
                hash: hash.clone(),
                title: PUSH_TITLE.to_string(),
                body: body.to_string(),
                device_token: token,
                token_type: device.push_token_type,
                platform: device.platform,
            };
            if let Err(e) = self.gateways.push.send(&message).await {
                warn!(flat_id = flat_id, error = %e, "Push notification failed");
            }
        }
    }
}

/// Split a face open detail `faceId|frsEventId`.
fn split_face_detail(detail: &str) -> Result<(&str, &str), CorrelateError> {
    match detail.split_once('|') {
        Some((face_id, event_id)) if !face_id.is_empty() && !event_id.is_empty() => {
            Ok((face_id, event_id))
        }
        _ => Err(CorrelateError::MalformedDetail(format!(
            "expected faceId|eventId, got '{detail}'"
        ))),
    }
}

#[async_trait]
impl DoorEventHandler for Correlator {
    async fn handle(&self, event: &DoorEvent) -> HandleResult {
        match self.correlate_door_event(event).await {
            Ok(_) => HandleResult::Done,
            Err(e) if e.is_permanent() => HandleResult::Rejected(e.to_string()),
            Err(e) => HandleResult::Failed(e.to_string()),
        }
    }
}
