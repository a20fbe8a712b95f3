//! Event classifier.
//!
//! Maps a syslog body to a [`ClassifiedEvent`] by walking an ordered table
//! of `(predicate, constructor)` rules. The first rule whose predicate
//! matches decides the outcome; if its constructor cannot extract the
//! parameters it needs, the line is [`ClassifiedEvent::Unrecognized`].
//!
//! # Rule order
//!
//! ```text
//! motion_start        SS_MAINAPI_ReportAlarmHappen
//! motion_stop         SS_MAINAPI_ReportAlarmFinish
//! open_by_button      door button pressed
//! open_by_code        Opening door by code
//! open_by_rfid        Opening door by RFID / external RFID
//! all_calls_done      All calls are done
//! door_opened_by_call Opening door by CMS handset / DTMF
//! call_answered       talk started
//! call_ended          call done
//! call_started        call started for apartment
//! ```

use crate::event::{CallKind, ClassifiedEvent, DoorSide};
use crate::syslog::RawMessage;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use tracing::trace;

static RFID_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9A-Fa-f]{14}\b").expect("RFID pattern is valid"));

/// One classification rule.
struct Rule {
    name: &'static str,
    matches: fn(&str) -> bool,
    build: fn(&str) -> Option<ClassifiedEvent>,
}

static RULES: &[Rule] = &[
    Rule {
        name: "motion_start",
        matches: |body| body.contains("SS_MAINAPI_ReportAlarmHappen"),
        build: |_| Some(ClassifiedEvent::Motion { active: true }),
    },
    Rule {
        name: "motion_stop",
        matches: |body| body.contains("SS_MAINAPI_ReportAlarmFinish"),
        build: |_| Some(ClassifiedEvent::Motion { active: false }),
    },
    Rule {
        name: "open_by_button",
        matches: |body| body.contains("door button pressed"),
        build: |body| {
            Some(ClassifiedEvent::OpenByButton {
                side: door_side(body),
            })
        },
    },
    Rule {
        name: "open_by_code",
        matches: |body| body.contains("Opening door by code"),
        build: |body| extract_code(body).map(|code| ClassifiedEvent::OpenByCode { code }),
    },
    Rule {
        name: "open_by_rfid",
        matches: |body| {
            body.contains("Opening door by RFID") || body.contains("Opening door by external RFID")
        },
        build: |body| {
            extract_rfid(body).map(|key| ClassifiedEvent::OpenByRfid {
                key,
                external: body.contains("external"),
            })
        },
    },
    Rule {
        name: "all_calls_done",
        matches: |body| body.contains("All calls are done"),
        build: |body| extract_apartment(body).map(|apartment| ClassifiedEvent::AllCallsDone { apartment }),
    },
    Rule {
        name: "door_opened_by_call",
        matches: |body| {
            body.contains("Opening door by CMS handset") || body.contains("Opening door by DTMF")
        },
        build: |body| extract_call_id(body).map(|call_id| ClassifiedEvent::DoorOpenedByCall { call_id }),
    },
    Rule {
        name: "call_answered",
        matches: |body| body.contains("talk started"),
        build: |body| extract_call_id(body).map(|call_id| ClassifiedEvent::CallAnswered { call_id }),
    },
    Rule {
        name: "call_ended",
        matches: |body| body.contains("call done"),
        build: |body| extract_call_id(body).map(|call_id| ClassifiedEvent::CallEnded { call_id }),
    },
    Rule {
        name: "call_started",
        matches: |body| body.contains("call started for apartment"),
        build: |body| {
            let call_id = extract_call_id(body)?;
            let apartment = extract_apartment(body)?;
            let kind = if body.contains("CMS") {
                CallKind::Cms
            } else {
                CallKind::Sip
            };
            Some(ClassifiedEvent::CallStarted {
                call_id,
                apartment,
                kind,
            })
        },
    },
];

/// A classified line together with the host it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub host: IpAddr,
    pub event: ClassifiedEvent,
}

/// Classify a parsed message received from `source_ip`.
pub fn classify(source_ip: IpAddr, message: &RawMessage) -> Classified {
    Classified {
        host: effective_host(&message.host, source_ip),
        event: classify_body(&message.body),
    }
}

/// Classify a bare body. Deterministic and total.
pub fn classify_body(body: &str) -> ClassifiedEvent {
    for rule in RULES {
        if (rule.matches)(body) {
            trace!(rule = rule.name, "Classification rule matched");
            return (rule.build)(body).unwrap_or(ClassifiedEvent::Unrecognized);
        }
    }
    ClassifiedEvent::Unrecognized
}

/// The address an event is attributed to.
///
/// The declared syslog hostname wins when it is a valid non-loopback IP that
/// differs from the datagram source (devices behind NAT); otherwise the
/// source address is used.
pub fn effective_host(declared: &str, source_ip: IpAddr) -> IpAddr {
    match declared.parse::<IpAddr>() {
        Ok(ip) if !ip.is_loopback() && ip != source_ip => ip,
        _ => source_ip,
    }
}

/// Substring denylist applied before anything else touches a line.
#[derive(Debug, Clone, Default)]
pub struct SpamFilter {
    words: Vec<String>,
}

impl SpamFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words
                .into_iter()
                .map(Into::into)
                .filter(|w: &String| !w.is_empty())
                .collect(),
        }
    }

    pub fn is_spam(&self, body: &str) -> bool {
        self.words.iter().any(|word| body.contains(word.as_str()))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

fn door_side(body: &str) -> DoorSide {
    if body.contains("Additional") {
        DoorSide::Secondary
    } else {
        DoorSide::Main
    }
}

/// First 14-hex-digit token.
pub fn extract_rfid(body: &str) -> Option<String> {
    RFID_KEY.find(body).map(|m| m.as_str().to_string())
}

/// Text between the token `code` and the next comma (or end of line).
pub fn extract_code(body: &str) -> Option<u32> {
    let start = body.find("code")? + "code".len();
    let rest = &body[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

/// Integer inside the first `[...]` pair.
pub fn extract_call_id(body: &str) -> Option<i64> {
    let open = body.find('[')?;
    let close = body[open..].find(']')? + open;
    body[open + 1..close].trim().parse().ok()
}

/// Integer following `apartment `, up to a space, `,`, `!`, `]` or `.`.
pub fn extract_apartment(body: &str) -> Option<i32> {
    let start = body.find("apartment ")? + "apartment ".len();
    let rest = &body[start..];
    let end = rest
        .find([' ', ',', '!', ']', '.'])
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}
