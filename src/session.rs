//! Call session bookkeeping.
//!
//! A call is reported by several independent syslog lines sharing a call
//! id. [`SessionRegistry`] folds them into one record:
//!
//! ```text
//! (none) --CallStarted--> Active(answered=false, door_opened=false)
//! Active --CallAnswered--> Active(answered=true)
//! Active --DoorOpenedByCall--> Active(door_opened=true)
//! Active --CallEnded--> Finalizing --(screenshot settles)--> plog row
//! any    --AllCallsDone(apartment)--> removed
//! ```
//!
//! Locking: the table lock guards insertion, lookup and removal only and is
//! never held across I/O or while a session lock is taken. Each session has
//! its own lock for field updates.
//!
//! Screenshot enrichment runs on a tracked task per session and signals
//! completion through a watch channel; the finalizer awaits that signal
//! with a ceiling and falls back to the image placeholder.

use crate::correlator::{CorrelateError, Site};
use crate::enrich::{Enricher, FrameLookup, Preview};
use crate::event::{CallKind, DoorSide, EventKind, PlogRecord};
use crate::gateway::{AnalyticsStore, AnalyticsTable, BlobMetadata, Gateways};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State of one call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: i64,
    pub apartment: i32,
    pub kind: CallKind,
    pub flat_id: i32,
    pub site: Site,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub answered: bool,
    pub door_opened: bool,
    pub preview: Preview,
    finalizing: bool,
}

impl CallSession {
    /// Build the plog row for this call. Without a settled screenshot the
    /// record carries the placeholder image.
    pub fn to_record(&self, screenshot_settled: bool) -> PlogRecord {
        let kind = if self.answered {
            EventKind::AnsweredCall
        } else {
            EventKind::UnansweredCall
        };

        let record = PlogRecord::new(kind, self.started_at, self.flat_id, self.site.descriptor())
            .with_opened(self.door_opened);

        if screenshot_settled {
            record.with_image(
                self.preview.image_ref.as_deref(),
                self.preview.kind,
                self.preview.face,
            )
        } else {
            record.with_image(None, self.preview.kind, None)
        }
    }
}

struct SessionEntry {
    apartment: i32,
    created: Instant,
    state: Arc<Mutex<CallSession>>,
    ready: watch::Receiver<bool>,
}

/// Live call sessions keyed by call id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, SessionEntry>>,
    tasks: TaskTracker,
    gateways: Gateways,
    enricher: Enricher,
    screenshot_wait: Duration,
}

impl SessionRegistry {
    pub fn new(gateways: Gateways, screenshot_wait: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            enricher: Enricher::new(gateways.clone()),
            gateways,
            screenshot_wait,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, call_id: i64) -> bool {
        self.sessions.lock().contains_key(&call_id)
    }

    /// Background enrichment and finalize tasks still running.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolve the call's site and flat, register the session and start its
    /// screenshot enrichment. Nothing is registered if resolution fails.
    pub async fn call_started(
        &self,
        call_id: i64,
        apartment: i32,
        kind: CallKind,
        host: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<(), CorrelateError> {
        if self.contains(call_id) {
            debug!(call_id = call_id, "Duplicate call start ignored");
            return Ok(());
        }

        let directory = self.gateways.directory.as_ref();
        let site = Site::by_ip(directory, &host.to_string(), DoorSide::Main).await?;
        let domophone_id = site.domophone.house_domophone_id;
        let flat_id = directory
            .flat_by_apartment(apartment, domophone_id)
            .await?
            .ok_or_else(|| {
                CorrelateError::Resolution(format!(
                    "no flat for apartment {apartment} on domophone {domophone_id}"
                ))
            })?;

        let camera = site.camera.clone();
        let state = Arc::new(Mutex::new(CallSession {
            call_id,
            apartment,
            kind,
            flat_id,
            site,
            started_at: at,
            ended_at: None,
            answered: false,
            door_opened: false,
            preview: Preview::none(),
            finalizing: false,
        }));
        let (ready_tx, ready_rx) = watch::channel(false);

        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&call_id) {
                debug!(call_id = call_id, "Duplicate call start ignored");
                return Ok(());
            }
            sessions.insert(
                call_id,
                SessionEntry {
                    apartment,
                    created: Instant::now(),
                    state: Arc::clone(&state),
                    ready: ready_rx,
                },
            );
        }

        info!(
            call_id = call_id,
            apartment = apartment,
            flat_id = flat_id,
            kind = ?kind,
            "Call session started"
        );

        let enricher = self.enricher.clone();
        self.tasks.spawn(async move {
            if let Some(camera) = camera {
                let metadata = BlobMetadata::screenshot(at).with_label("call_id", call_id);
                let preview = enricher
                    .capture(&camera, FrameLookup::ByTime(at), metadata)
                    .await;
                state.lock().preview = preview;
            }
            ready_tx.send_replace(true);
        });

        Ok(())
    }

    /// Mark a call answered. Returns `false` when the session is unknown.
    pub fn call_answered(&self, call_id: i64) -> bool {
        self.update(call_id, |session| session.answered = true)
    }

    /// Mark the door opened during a call. Returns `false` when the session
    /// is unknown.
    pub fn door_opened(&self, call_id: i64) -> bool {
        self.update(call_id, |session| session.door_opened = true)
    }

    fn update<F: FnOnce(&mut CallSession)>(&self, call_id: i64, apply: F) -> bool {
        let state = self
            .sessions
            .lock()
            .get(&call_id)
            .map(|entry| Arc::clone(&entry.state));

        match state {
            Some(state) => {
                apply(&mut state.lock());
                true
            }
            None => {
                debug!(call_id = call_id, "No session for call");
                false
            }
        }
    }

    /// Record the end of a call and spawn its finalizer. A second end for the
    /// same call is ignored.
    pub fn call_ended(&self, call_id: i64, at: DateTime<Utc>) -> bool {
        let entry = self
            .sessions
            .lock()
            .get(&call_id)
            .map(|entry| (Arc::clone(&entry.state), entry.ready.clone()));

        let Some((state, ready)) = entry else {
            debug!(call_id = call_id, "No session for ended call");
            return false;
        };

        {
            let mut session = state.lock();
            if session.finalizing {
                debug!(call_id = call_id, "Call already finalizing");
                return false;
            }
            session.finalizing = true;
            session.ended_at = Some(at);
        }

        let analytics = Arc::clone(&self.gateways.analytics);
        let wait = self.screenshot_wait;
        self.tasks
            .spawn(async move { finalize(state, ready, wait, analytics).await });
        true
    }

    /// Drop every session of `apartment`, whatever its call id. Returns how
    /// many were removed.
    pub fn all_calls_done(&self, apartment: i32) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.apartment != apartment);
        let removed = before - sessions.len();
        drop(sessions);

        debug!(apartment = apartment, removed = removed, "All calls done");
        removed
    }

    /// Drop sessions older than `ttl`. Returns how many were removed.
    pub fn sweep_stale(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.created.elapsed() < ttl);
        before - sessions.len()
    }

    /// Periodically purge sessions that never saw a terminal message.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        ttl: Duration,
        shutdown: crate::shutdown::ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let removed = self.sweep_stale(ttl);
            if removed > 0 {
                info!(removed = removed, remaining = self.len(), "Swept stale call sessions");
            }
        }
    }

    /// Stop accepting background work and wait for running tasks up to
    /// `deadline`. Returns `false` if some were abandoned.
    pub async fn shutdown(&self, deadline: tokio::time::Instant) -> bool {
        self.tasks.close();
        match tokio::time::timeout_at(deadline, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tasks.len(),
                    "Abandoning call session tasks at shutdown"
                );
                false
            }
        }
    }
}

async fn finalize(
    state: Arc<Mutex<CallSession>>,
    mut ready: watch::Receiver<bool>,
    wait: Duration,
    analytics: Arc<dyn AnalyticsStore>,
) {
    // A dropped sender means enrichment is over either way.
    let settled = tokio::time::timeout(wait, ready.wait_for(|ready| *ready))
        .await
        .is_ok();

    let session = state.lock().clone();
    if !settled {
        warn!(call_id = session.call_id, "Screenshot not ready, finalizing without image");
    }

    let record = session.to_record(settled);
    let row = match serde_json::to_value(&record) {
        Ok(row) => row,
        Err(e) => {
            warn!(call_id = session.call_id, error = %e, "Failed to encode call record");
            return;
        }
    };

    match analytics.append(AnalyticsTable::Plog, vec![row]).await {
        Ok(()) => info!(
            call_id = session.call_id,
            flat_id = session.flat_id,
            answered = session.answered,
            door_opened = session.door_opened,
            "Call recorded"
        ),
        Err(e) => warn!(call_id = session.call_id, error = %e, "Failed to persist call record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeDirectory, Fakes};

    fn host() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    fn fakes(camera: bool) -> Fakes {
        let directory = FakeDirectory::new()
            .domophone(7, "10.0.0.5")
            .entrance(7, DoorSide::Main, 3, camera.then_some(8))
            .camera(8, None, None)
            .apartment(7, 5, 42);
        Fakes::new(directory)
    }

    async fn wait_rows(fakes: &Fakes, count: usize) -> Vec<serde_json::Value> {
        assert!(
            eventually(
                || fakes.analytics.rows(AnalyticsTable::Plog).len() >= count,
                Duration::from_secs(2)
            )
            .await
        );
        fakes.analytics.rows(AnalyticsTable::Plog)
    }

    #[tokio::test]
    async fn test_answered_call_with_screenshot() {
        let fakes = fakes(true);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        registry
            .call_started(1, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap();
        assert!(registry.call_answered(1));
        assert!(registry.call_ended(1, Utc::now()));

        let rows = wait_rows(&fakes, 1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event"], 2);
        assert_eq!(rows[0]["opened"], 0);
        assert_eq!(rows[0]["flat_id"], 42);
        assert_eq!(rows[0]["preview"], 1);
        assert_eq!(rows[0]["image_uuid"], "blob-1");
        assert_eq!(
            fakes.blobs.saved()[0].1.labels,
            vec![
                ("call_id".to_string(), "1".to_string()),
                ("camera_id".to_string(), "8".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_door_opened_and_unanswered() {
        let fakes = fakes(false);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        registry
            .call_started(1, 5, CallKind::Cms, host(), Utc::now())
            .await
            .unwrap();
        registry.call_answered(1);
        registry.door_opened(1);
        registry.call_ended(1, Utc::now());

        let rows = wait_rows(&fakes, 1).await;
        assert_eq!(rows[0]["event"], 2);
        assert_eq!(rows[0]["opened"], 1);
        assert_eq!(rows[0]["preview"], 0);

        registry.all_calls_done(5);
        registry
            .call_started(2, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap();
        registry.call_ended(2, Utc::now());

        let rows = wait_rows(&fakes, 2).await;
        assert_eq!(rows[1]["event"], 1);
        assert_eq!(rows[1]["opened"], 0);
    }

    #[tokio::test]
    async fn test_all_calls_done_before_screenshot_ready() {
        let fakes = fakes(true);
        fakes.images.set_delay(Duration::from_millis(500));
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_millis(50));

        registry
            .call_started(1, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap();
        registry.call_answered(1);
        registry.call_ended(1, Utc::now());
        assert_eq!(registry.all_calls_done(5), 1);
        assert!(!registry.contains(1));

        let rows = wait_rows(&fakes, 1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event"], 2);
        assert_eq!(rows[0]["preview"], 0);
        assert_eq!(rows[0]["image_uuid"], crate::event::IMAGE_PLACEHOLDER);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_failure_registers_nothing() {
        let fakes = Fakes::new(FakeDirectory::new());
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        let err = registry
            .call_started(1, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelateError::Resolution(_)));
        assert!(registry.is_empty());

        // later lines for the lost call are no-ops
        assert!(!registry.call_answered(1));
        assert!(!registry.door_opened(1));
        assert!(!registry.call_ended(1, Utc::now()));
    }

    #[tokio::test]
    async fn test_missing_flat_registers_nothing() {
        let fakes = fakes(false);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        assert!(registry
            .call_started(1, 99, CallKind::Sip, host(), Utc::now())
            .await
            .is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_double_end_records_once() {
        let fakes = fakes(false);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        registry
            .call_started(1, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap();
        assert!(registry.call_ended(1, Utc::now()));
        assert!(!registry.call_ended(1, Utc::now()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        assert!(registry.shutdown(deadline).await);
        assert_eq!(fakes.analytics.rows(AnalyticsTable::Plog).len(), 1);
    }

    #[tokio::test]
    async fn test_all_calls_done_is_per_apartment() {
        let directory = FakeDirectory::new()
            .domophone(7, "10.0.0.5")
            .entrance(7, DoorSide::Main, 3, None)
            .apartment(7, 5, 42)
            .apartment(7, 6, 43);
        let fakes = Fakes::new(directory);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));

        for (call_id, apartment) in [(1, 5), (2, 5), (3, 6)] {
            registry
                .call_started(call_id, apartment, CallKind::Sip, host(), Utc::now())
                .await
                .unwrap();
        }

        assert_eq!(registry.all_calls_done(5), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(3));
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let fakes = fakes(false);
        let registry = SessionRegistry::new(fakes.gateways(), Duration::from_secs(1));
        registry
            .call_started(1, 5, CallKind::Sip, host(), Utc::now())
            .await
            .unwrap();

        assert_eq!(registry.sweep_stale(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep_stale(Duration::from_millis(10)), 1);
        assert!(registry.is_empty());
    }
}
