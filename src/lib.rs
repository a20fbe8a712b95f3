//! # doorwatch
//!
//! Event ingestion for building intercoms: syslog lines from door panels and
//! canonical door events from the backend, turned into enriched access
//! records.
//!
//! ## Architecture
//!
//! ```text
//! intercom --UDP--> SyslogListener -> SyslogRouter -+-> Correlator ------+
//!                                                   +-> SessionRegistry -+-> analytics
//! backend --XADD--> door_open_events_stream -> QueueProcessor -> Correlator
//! ```
//!
//! ## Modules
//!
//! - [`syslog`]: Datagram parsing
//! - [`classify`]: Body classification and spam filtering
//! - [`router`]: Per-listener dispatch
//! - [`correlator`]: Single-shot events to enriched records
//! - [`session`]: Call session tracking
//! - [`enrich`]: Screenshot capture
//! - [`queue`]: Redis Streams consumption
//! - [`gateway`]: Outbound services

pub mod classify;
pub mod config;
pub mod correlator;
pub mod enrich;
pub mod event;
pub mod gateway;
pub mod http;
pub mod listener;
pub mod queue;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod syslog;

#[cfg(test)]
pub(crate) mod testing;

pub use config::DoorwatchConfig;
pub use correlator::{CorrelateError, Correlator};
pub use event::{ClassifiedEvent, DoorEvent, EventKind, PlogRecord};
pub use router::SyslogRouter;
pub use session::SessionRegistry;

/// Redis stream the backend publishes door events to
pub const EVENT_STREAM_NAME: &str = "door_open_events_stream";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "doorwatch_workers";
