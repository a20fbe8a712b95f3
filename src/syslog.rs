//! Syslog wire parser.
//!
//! Turns one UDP datagram into a [`RawMessage`]. Two wire shapes are tried
//! in order, after an optional vendor-specific prefix split:
//!
//! ```text
//! prefix  : "<anything>: <body>"                       (Framing::Prefix only)
//! RFC5424 : <PRI>VER TIMESTAMP HOST APP PROCID MSGID SD [BODY]
//! BSD     : <PRI>Mmm dd hh:mm:ss [HOST] APP TAG: BODY
//! ```
//!
//! Only the host and the free-text body matter downstream; classification
//! runs on the body alone.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use thiserror::Error;

static RFC5424: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^<(?P<priority>\d|\d{2}|1[1-8]\d|19[01])>(?P<version>\d{1,2})\s",
        r"(?P<timestamp>-|(?P<fullyear>[12]\d{3})-(?P<month>0\d|1[012])-(?P<mday>[012]\d|3[01])",
        r"T(?P<hour>[01]\d|2[0-4]):(?P<minute>[0-5]\d):(?P<second>[0-5]\d|60)",
        r"(?:\.(?P<secfrac>\d{1,6}))?(?P<numoffset>Z|[+-]\d{2}:\d{2}))\s",
        r"(?P<hostname>\S{1,255})\s(?P<appname>\S{1,48})\s(?P<procid>\S{1,128})\s(?P<msgid>\S{1,32})\s",
        r"(?P<structureddata>-|(?:\[.+?\]))(?:\s(?P<message>.+))?$",
    ))
    .expect("RFC5424 pattern is valid")
});

static BSD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<(?P<priority>\d{1,3})>(?P<timestamp>\w+\s+\d{1,2}\s\d{2}:\d{2}:\d{2})\s(?P<hostname>\S+)?\s(?P<appname>[\w\s.]+)\s(?P<tag>\S+):\s(?P<message>.*)$",
    )
    .expect("BSD pattern is valid")
});

/// How a listener splits its datagrams before the regexes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// RFC5424, then BSD
    #[default]
    Standard,
    /// Vendors that prepend a fixed tag: everything after the first `": "`
    /// is the body and no host is declared.
    Prefix,
}

/// Which wire shape a datagram matched. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogFormat {
    Rfc5424,
    Bsd,
    Unknown,
}

/// A decoded syslog datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub format: SyslogFormat,
    /// Hostname declared in the header, empty when none was declared
    pub host: String,
    pub timestamp: Option<String>,
    pub body: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,

    #[error("unsupported syslog format: {0}")]
    UnsupportedFormat(String),
}

/// Decode one datagram.
pub fn parse(bytes: &[u8], framing: Framing) -> Result<RawMessage, ParseError> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim();

    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    if framing == Framing::Prefix {
        if let Some((_, body)) = line.split_once(": ") {
            return Ok(RawMessage {
                format: SyslogFormat::Unknown,
                host: String::new(),
                timestamp: None,
                body: body.to_string(),
            });
        }
    }

    if let Some(caps) = RFC5424.captures(line) {
        let timestamp = caps
            .name("timestamp")
            .map(|m| m.as_str())
            .filter(|ts| *ts != "-")
            .map(str::to_string);

        return Ok(RawMessage {
            format: SyslogFormat::Rfc5424,
            host: capture(&caps, "hostname"),
            timestamp,
            body: capture(&caps, "message"),
        });
    }

    if let Some(caps) = BSD.captures(line) {
        return Ok(RawMessage {
            format: SyslogFormat::Bsd,
            host: capture(&caps, "hostname"),
            timestamp: caps.name("timestamp").map(|m| m.as_str().to_string()),
            body: capture(&caps, "message"),
        });
    }

    Err(ParseError::UnsupportedFormat(excerpt(line)))
}

fn capture(caps: &regex::Captures<'_>, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn excerpt(line: &str) -> String {
    line.chars().take(64).collect()
}
