//! Core event types for doorwatch.
//!
//! Three families of types flow through the service:
//!
//! - [`ClassifiedEvent`]: what a single intercom syslog line means
//! - [`DoorEvent`]: the canonical door event carried by the Redis stream
//! - [`PlogRecord`] and [`SyslogRecord`]: rows appended to the analytics store
//!
//! ```text
//! UDP line -> ClassifiedEvent ─┐
//!                              ├─> PlogRecord ("plog" table)
//! Stream   -> DoorEvent ───────┘
//! UDP line -> SyslogRecord ("syslog" table)
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

/// Image reference written when no screenshot could be stored.
pub const IMAGE_PLACEHOLDER: &str = "00000000-0000-0000-0000-000000000000";

/// Door output of a domophone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DoorSide {
    Main = 0,
    Secondary = 1,
}

impl DoorSide {
    /// Directory `domophone_output` value for this side.
    pub fn output(self) -> i32 {
        self as i32
    }

    pub fn from_output(output: i32) -> Self {
        if output == 1 {
            DoorSide::Secondary
        } else {
            DoorSide::Main
        }
    }
}

/// Line a call was placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallKind {
    Sip,
    Cms,
}

/// Semantic meaning of one syslog body.
///
/// Produced by [`crate::classify::classify`], consumed immediately by the
/// datagram router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    Motion { active: bool },
    OpenByCode { code: u32 },
    OpenByRfid { key: String, external: bool },
    OpenByButton { side: DoorSide },
    CallStarted { call_id: i64, apartment: i32, kind: CallKind },
    CallAnswered { call_id: i64 },
    DoorOpenedByCall { call_id: i64 },
    CallEnded { call_id: i64 },
    AllCallsDone { apartment: i32 },
    Unrecognized,
}

impl ClassifiedEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ClassifiedEvent::Motion { .. } => "motion",
            ClassifiedEvent::OpenByCode { .. } => "open_by_code",
            ClassifiedEvent::OpenByRfid { .. } => "open_by_rfid",
            ClassifiedEvent::OpenByButton { .. } => "open_by_button",
            ClassifiedEvent::CallStarted { .. } => "call_started",
            ClassifiedEvent::CallAnswered { .. } => "call_answered",
            ClassifiedEvent::DoorOpenedByCall { .. } => "door_opened_by_call",
            ClassifiedEvent::CallEnded { .. } => "call_ended",
            ClassifiedEvent::AllCallsDone { .. } => "all_calls_done",
            ClassifiedEvent::Unrecognized => "unrecognized",
        }
    }

    /// Door the event acts on. External RFID readers are wired to the
    /// secondary output.
    pub fn door_side(&self) -> DoorSide {
        match self {
            ClassifiedEvent::OpenByButton { side } => *side,
            ClassifiedEvent::OpenByRfid { external: true, .. } => DoorSide::Secondary,
            _ => DoorSide::Main,
        }
    }
}

/// Kind of an enriched access event, stored as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum EventKind {
    UnansweredCall = 1,
    AnsweredCall = 2,
    OpenedByKey = 3,
    OpenedByApp = 4,
    OpenedByFace = 5,
    OpenedByCode = 6,
    OpenedGatesByCall = 7,
    OpenedByVehicle = 9,
}

impl EventKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for EventKind {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventKind::UnansweredCall),
            2 => Ok(EventKind::AnsweredCall),
            3 => Ok(EventKind::OpenedByKey),
            4 => Ok(EventKind::OpenedByApp),
            5 => Ok(EventKind::OpenedByFace),
            6 => Ok(EventKind::OpenedByCode),
            7 => Ok(EventKind::OpenedGatesByCall),
            9 => Ok(EventKind::OpenedByVehicle),
            other => Err(other),
        }
    }
}

/// Provenance of the screenshot attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum PreviewKind {
    #[default]
    None = 0,
    Camera = 1,
    Frs = 2,
}

/// Face bounding box reported by the face-recognition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

/// Where an event physically happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomophoneDescriptor {
    pub camera_id: Option<i32>,
    /// Entrance caption shown to residents
    pub domophone_description: String,
    pub domophone_id: i32,
    pub domophone_output: i32,
    pub entrance_id: i32,
    pub house_id: Option<i32>,
}

/// Phone attached to app-initiated opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Phones {
    pub user_phone: String,
}

/// The enriched access event persisted to the `plog` table.
///
/// Built once per resolved flat and never mutated after it is appended.
///
/// # Example
///
/// ```json
/// {
///   "date": 1760791234,
///   "event_uuid": "5f0c...",
///   "hidden": 0,
///   "image_uuid": "00000000-0000-0000-0000-000000000000",
///   "flat_id": 42,
///   "domophone": {"camera_id": null, "domophone_description": "Entrance 1", ...},
///   "event": 6,
///   "opened": 1,
///   "code": "1234",
///   "preview": 0
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct PlogRecord {
    pub date: i64,
    pub event_uuid: Uuid,
    pub hidden: u8,
    pub image_uuid: String,
    pub flat_id: i32,
    pub domophone: DomophoneDescriptor,
    pub event: EventKind,
    #[serde(serialize_with = "bool_as_int")]
    pub opened: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<FaceRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phones: Option<Phones>,
    pub preview: PreviewKind,
}

impl PlogRecord {
    /// Create a record with a fresh event UUID and no image.
    ///
    /// Every kind except an unanswered call counts as an open.
    pub fn new(
        kind: EventKind,
        at: DateTime<Utc>,
        flat_id: i32,
        domophone: DomophoneDescriptor,
    ) -> Self {
        Self {
            date: at.timestamp(),
            event_uuid: Uuid::new_v4(),
            hidden: 0,
            image_uuid: IMAGE_PLACEHOLDER.to_string(),
            flat_id,
            domophone,
            event: kind,
            opened: kind != EventKind::UnansweredCall,
            face: None,
            rfid: None,
            code: None,
            phones: None,
            preview: PreviewKind::None,
        }
    }

    /// Attach a stored screenshot. A missing reference keeps the placeholder
    /// and forces the preview kind to none.
    pub fn with_image(
        mut self,
        image_ref: Option<&str>,
        preview: PreviewKind,
        face: Option<FaceRegion>,
    ) -> Self {
        match image_ref {
            Some(image_ref) => {
                self.image_uuid = image_ref.to_string();
                self.preview = preview;
                self.face = face;
            }
            None => {
                self.image_uuid = IMAGE_PLACEHOLDER.to_string();
                self.preview = PreviewKind::None;
                self.face = None;
            }
        }
        self
    }

    pub fn with_opened(mut self, opened: bool) -> Self {
        self.opened = opened;
        self
    }

    pub fn with_rfid(mut self, key: impl Into<String>) -> Self {
        self.rfid = Some(key.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phones = Some(Phones {
            user_phone: phone.into(),
        });
        self
    }
}

fn bool_as_int<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

/// Raw audit row for the `syslog` table, written for every parsed line that
/// is not spam.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyslogRecord {
    /// Unix seconds, as a string
    pub date: String,
    pub ip: String,
    pub sub_id: String,
    /// Vendor tag of the listener that received the line
    pub unit: String,
    pub msg: String,
}

impl SyslogRecord {
    pub fn new(
        at: DateTime<Utc>,
        ip: impl Into<String>,
        unit: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            date: at.timestamp().to_string(),
            ip: ip.into(),
            sub_id: String::new(),
            unit: unit.into(),
            msg: msg.into(),
        }
    }
}

/// Canonical door event published to the stream by the backend.
///
/// Carried as JSON in the `payload` field of each stream entry.
///
/// # Example
///
/// ```json
/// {"date": 1760791234, "ip": "10.0.0.5", "sub_id": null,
///  "event_type": 4, "door": 0, "detail": "79001234567"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorEvent {
    /// Unix seconds
    pub date: i64,

    /// Domophone id; when absent the domophone is resolved by `ip`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domophone_id: Option<i32>,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub sub_id: Option<i64>,

    /// Numeric [`EventKind`] code
    pub event_type: i32,

    /// Directory `domophone_output`
    #[serde(default)]
    pub door: i32,

    /// Kind-specific detail: RFID key, phone, code, or `faceId|frsEventId`
    #[serde(default)]
    pub detail: String,
}

impl DoorEvent {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::try_from(self.event_type).ok()
    }

    /// Event time, falling back to now for out-of-range dates.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.date, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn door_side(&self) -> DoorSide {
        DoorSide::from_output(self.door)
    }
}
