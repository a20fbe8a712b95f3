//! Datagram router - the brain of a syslog listener.
//!
//! One [`SyslogRouter`] serves one vendor port. Every datagram goes through
//! the same pipeline:
//!
//! ```text
//! bytes
//!   │ parse (framing)          ── error ──> Malformed (no audit)
//!   ▼
//! RawMessage
//!   │ spam filter              ── match ──> Spam (no audit)
//!   ▼
//!   │ classify + audit row ("syslog" table, always)
//!   ▼
//! ClassifiedEvent
//!   ├── Motion / OpenBy*      ──> Correlator
//!   ├── Call*                 ──> SessionRegistry
//!   └── Unrecognized          ──> dropped
//! ```

use crate::classify::{classify, SpamFilter};
use crate::config::ListenerConfig;
use crate::correlator::{CorrelateError, Correlator, Outcome};
use crate::event::{ClassifiedEvent, SyslogRecord};
use crate::gateway::{AnalyticsStore, AnalyticsTable};
use crate::http::Metrics;
use crate::session::SessionRegistry;
use crate::syslog::{parse, Framing};
use chrono::Utc;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the router did with one datagram.
#[derive(Debug)]
pub enum Dispatch {
    /// Not a syslog line
    Malformed,
    /// Matched the spam filter
    Spam,
    /// Audited but not understood
    Unrecognized,
    /// Handled by the correlator
    Correlated(Outcome),
    /// Applied to the session table; `false` when no session matched
    Session(bool),
    /// Event aborted
    Failed(CorrelateError),
}

/// Routes datagrams from one vendor listener.
pub struct SyslogRouter {
    vendor: String,
    framing: Framing,
    spam: SpamFilter,
    analytics: Arc<dyn AnalyticsStore>,
    correlator: Correlator,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
}

impl SyslogRouter {
    pub fn new(
        listener: &ListenerConfig,
        analytics: Arc<dyn AnalyticsStore>,
        correlator: Correlator,
        sessions: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            vendor: listener.vendor.clone(),
            framing: listener.framing,
            spam: SpamFilter::new(listener.spam_words.iter().cloned()),
            analytics,
            correlator,
            sessions,
            metrics,
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Run one datagram received from `source` through the pipeline.
    pub async fn route(&self, datagram: &[u8], source: IpAddr) -> Dispatch {
        self.metrics.datagrams.fetch_add(1, Ordering::Relaxed);

        let raw = match parse(datagram, self.framing) {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(vendor = %self.vendor, source = %source, error = %e, "Dropping datagram");
                return Dispatch::Malformed;
            }
        };

        if self.spam.is_spam(&raw.body) {
            self.metrics.spam.fetch_add(1, Ordering::Relaxed);
            return Dispatch::Spam;
        }

        let at = Utc::now();
        let classified = classify(source, &raw);
        self.audit(&SyslogRecord::new(
            at,
            classified.host.to_string(),
            &self.vendor,
            &raw.body,
        ))
        .await;

        let host = classified.host;
        let event = classified.event;
        debug!(vendor = %self.vendor, host = %host, event = event.name(), "Classified");

        let result = match &event {
            ClassifiedEvent::Unrecognized => return Dispatch::Unrecognized,
            ClassifiedEvent::CallStarted {
                call_id,
                apartment,
                kind,
            } => self
                .sessions
                .call_started(*call_id, *apartment, *kind, host, at)
                .await
                .map(|()| Dispatch::Session(true)),
            ClassifiedEvent::CallAnswered { call_id } => {
                Ok(Dispatch::Session(self.sessions.call_answered(*call_id)))
            }
            ClassifiedEvent::DoorOpenedByCall { call_id } => {
                Ok(Dispatch::Session(self.sessions.door_opened(*call_id)))
            }
            ClassifiedEvent::CallEnded { call_id } => {
                Ok(Dispatch::Session(self.sessions.call_ended(*call_id, at)))
            }
            ClassifiedEvent::AllCallsDone { apartment } => {
                Ok(Dispatch::Session(self.sessions.all_calls_done(*apartment) > 0))
            }
            _ => self
                .correlator
                .correlate(&event, host, at)
                .await
                .map(Dispatch::Correlated),
        };

        match result {
            Ok(Dispatch::Correlated(Outcome::Recorded(records))) => {
                self.metrics
                    .records
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                Dispatch::Correlated(Outcome::Recorded(records))
            }
            Ok(Dispatch::Correlated(Outcome::Skipped(reason))) => {
                info!(vendor = %self.vendor, host = %host, event = event.name(), reason = reason, "Event skipped");
                Dispatch::Correlated(Outcome::Skipped(reason))
            }
            Ok(dispatch) => dispatch,
            Err(e) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    vendor = %self.vendor,
                    host = %host,
                    event = event.name(),
                    error = %e,
                    "Event dropped"
                );
                Dispatch::Failed(e)
            }
        }
    }

    async fn audit(&self, record: &SyslogRecord) {
        let row = match serde_json::to_value(record) {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "Failed to encode audit row");
                return;
            }
        };

        match self.analytics.append(AnalyticsTable::Syslog, vec![row]).await {
            Ok(()) => {
                self.metrics.audit_rows.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(vendor = %self.vendor, error = %e, "Failed to write audit row"),
        }
    }
}
