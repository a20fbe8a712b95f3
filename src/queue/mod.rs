//! Durable door event queue consumption.
//!
//! Canonical [`DoorEvent`]s are published to a stream and consumed by a
//! consumer group with at-least-once delivery:
//!
//! ```text
//! XADD door_open_events_stream * payload {...}
//!            │
//!            ├── worker_0 ─┐
//!            ├── worker_1 ─┼─> DoorEventHandler -> XACK on success
//!            ├── ...      ─┘
//!            └── pending_recovery: XAUTOCLAIM idle entries, same handling
//! ```
//!
//! A failed message stays pending and is picked up again by the recovery
//! worker once its idle time passes the threshold.

#[cfg(test)]
pub mod memory;
pub mod redis;

use crate::config::StreamConfig;
use crate::event::DoorEvent;
use crate::http::Metrics;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub use self::redis::RedisStreamQueue;

/// Stream field carrying the JSON-encoded [`DoorEvent`].
pub const PAYLOAD_FIELD: &str = "payload";

/// Consumer name of the recovery worker.
pub const RECOVERY_CONSUMER: &str = "pending_recovery";

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after a failed claim before trying again.
const RECOVERY_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// One stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl QueueMessage {
    pub fn payload(&self) -> Option<&str> {
        self.fields.get(PAYLOAD_FIELD).map(String::as_str)
    }
}

/// Consumer-group operations on a durable stream.
#[async_trait]
pub trait StreamQueue: Send + Sync {
    /// Create the consumer group at the stream origin. An existing group is
    /// not an error.
    async fn ensure_group(&self) -> Result<(), QueueError>;

    /// Read up to `count` new entries for `consumer`, blocking up to `block`.
    /// An empty result means nothing arrived in the window.
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge entries, returning how many were still pending.
    async fn ack(&self, ids: &[String]) -> Result<u64, QueueError>;

    /// Transfer up to `count` entries idle for at least `min_idle` to
    /// `consumer` and return them.
    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;
}

/// How a handler disposed of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleResult {
    /// Processed; acknowledge
    Done,
    /// Can never succeed; acknowledge and log
    Rejected(String),
    /// May succeed later; leave pending
    Failed(String),
}

#[async_trait]
pub trait DoorEventHandler: Send + Sync {
    async fn handle(&self, event: &DoorEvent) -> HandleResult;
}

/// Tuning for [`QueueProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub block: Duration,
    pub pending_min_idle: Duration,
    pub recovery_interval: Duration,
    pub claim_count: usize,
    /// Worker consumers are named `{consumer_prefix}-worker_{i}`
    pub consumer_prefix: String,
}

impl ProcessorSettings {
    pub fn from_config(config: &StreamConfig, consumer_prefix: impl Into<String>) -> Self {
        Self {
            workers: config.workers.max(1),
            batch_size: config.batch_size,
            block: config.block(),
            pending_min_idle: config.pending_min_idle(),
            recovery_interval: config.recovery_interval(),
            claim_count: config.claim_count,
            consumer_prefix: consumer_prefix.into(),
        }
    }

    fn worker_name(&self, index: usize) -> String {
        format!("{}-worker_{}", self.consumer_prefix, index)
    }
}

/// Multi-worker consumer with idle-message recovery.
pub struct QueueProcessor {
    queue: Arc<dyn StreamQueue>,
    handler: Arc<dyn DoorEventHandler>,
    settings: ProcessorSettings,
    metrics: Arc<Metrics>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn StreamQueue>,
        handler: Arc<dyn DoorEventHandler>,
        settings: ProcessorSettings,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            handler,
            settings,
            metrics,
        })
    }

    /// Ensure the consumer group, then spawn the workers and the recovery
    /// worker on `tasks`. Only group creation can fail.
    pub async fn start(
        self: &Arc<Self>,
        tasks: &TaskTracker,
        shutdown: &ShutdownSignal,
    ) -> Result<(), QueueError> {
        self.queue.ensure_group().await?;

        for index in 0..self.settings.workers {
            let processor = Arc::clone(self);
            let shutdown = shutdown.clone();
            let name = self.settings.worker_name(index);
            tasks.spawn(async move { processor.run_worker(name, shutdown).await });
        }

        let processor = Arc::clone(self);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { processor.run_recovery(shutdown).await });

        info!(
            workers = self.settings.workers,
            batch_size = self.settings.batch_size,
            "Queue processor started"
        );
        Ok(())
    }

    async fn run_worker(&self, name: String, shutdown: ShutdownSignal) {
        info!(worker = %name, "Worker started");

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.queue.read_group(&name, self.settings.batch_size, self.settings.block) => read,
            };

            match read {
                Ok(messages) => {
                    for message in messages {
                        self.process(&name, message).await;
                    }
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "Stream read error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(worker = %name, "Worker stopping");
    }

    async fn run_recovery(&self, shutdown: ShutdownSignal) {
        info!(worker = RECOVERY_CONSUMER, "Pending worker started");

        loop {
            let pause = match self.recover_once().await {
                Ok(_) => self.settings.recovery_interval,
                Err(e) => {
                    error!(worker = RECOVERY_CONSUMER, error = %e, "Pending worker error");
                    RECOVERY_ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(worker = RECOVERY_CONSUMER, "Pending worker stopping");
    }

    /// Claim idle entries once and process them. Returns how many were
    /// claimed.
    pub async fn recover_once(&self) -> Result<usize, QueueError> {
        let messages = self
            .queue
            .claim_idle(
                RECOVERY_CONSUMER,
                self.settings.pending_min_idle,
                self.settings.claim_count,
            )
            .await?;

        let count = messages.len();
        if count > 0 {
            info!(count = count, "Claimed pending messages");
        }
        for message in messages {
            self.process(RECOVERY_CONSUMER, message).await;
        }
        Ok(count)
    }

    /// Decode, handle and acknowledge one entry.
    async fn process(&self, worker: &str, message: QueueMessage) {
        let event = match message
            .payload()
            .map(serde_json::from_str::<DoorEvent>)
        {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(worker = %worker, id = %message.id, error = %e, "Skipping undecodable event");
                self.acknowledge(worker, &message.id).await;
                return;
            }
            None => {
                warn!(worker = %worker, id = %message.id, "Skipping entry without payload");
                self.acknowledge(worker, &message.id).await;
                return;
            }
        };

        debug!(
            worker = %worker,
            id = %message.id,
            event_type = event.event_type,
            "Processing event"
        );

        match self.handler.handle(&event).await {
            HandleResult::Done => {
                self.acknowledge(worker, &message.id).await;
            }
            HandleResult::Rejected(reason) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %worker, id = %message.id, reason = %reason, "Event rejected");
                self.acknowledge(worker, &message.id).await;
            }
            HandleResult::Failed(reason) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = %worker,
                    id = %message.id,
                    reason = %reason,
                    "Event failed, leaving pending"
                );
            }
        }
    }

    async fn acknowledge(&self, worker: &str, id: &str) {
        match self.queue.ack(&[id.to_string()]).await {
            Ok(_) => {
                self.metrics.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(worker = %worker, id = %id, error = %e, "Failed to ACK message");
            }
        }
    }
}
