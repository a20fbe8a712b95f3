//! Graceful shutdown coordination for doorwatch.
//!
//! A [`ShutdownSignal`] wraps one cancellation token shared by the UDP
//! listeners, queue workers, the recovery worker and the session sweeper.
//! Long-running loops select on [`ShutdownSignal::cancelled`] and finish
//! their current iteration; the binary then waits for every tracked task
//! with [`ShutdownSignal::drain`], bounded by the configured timeout. Several
//! waits can share one [`ShutdownSignal::deadline`] through
//! [`ShutdownSignal::drain_until`].
//!
//! # Example
//!
//! ```rust,ignore
//! use doorwatch::shutdown::ShutdownSignal;
//! use tokio_util::task::TaskTracker;
//!
//! let shutdown = ShutdownSignal::new();
//! let tasks = TaskTracker::new();
//!
//! let worker_shutdown = shutdown.clone();
//! tasks.spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = worker_shutdown.cancelled() => break,
//!             // ... process events
//!         }
//!     }
//! });
//!
//! shutdown.wait().await;
//! shutdown.drain(&tasks).await;
//! ```

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The instant the shutdown timeout runs out, counted from now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Wait for SIGTERM or SIGINT, then cancel every holder of this signal.
    ///
    /// Returns early if shutdown was triggered programmatically.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.token.cancel();
    }

    /// Close `tasks` and wait for them to finish within the shutdown timeout.
    ///
    /// Returns `true` if every task completed, `false` if the timeout hit.
    pub async fn drain(&self, tasks: &TaskTracker) -> bool {
        self.drain_until(tasks, self.deadline()).await
    }

    /// Like [`drain`](Self::drain), but bounded by an absolute deadline.
    pub async fn drain_until(&self, tasks: &TaskTracker, deadline: Instant) -> bool {
        tasks.close();
        match tokio::time::timeout_at(deadline, tasks.wait()).await {
            Ok(()) => {
                info!("All tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    remaining = tasks.len(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(200), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(200), signal.wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_loops() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(1));
        let tasks = TaskTracker::new();

        for _ in 0..3 {
            let worker = signal.clone();
            tasks.spawn(async move {
                worker.cancelled().await;
            });
        }

        signal.trigger();
        assert!(signal.drain(&tasks).await);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(20));
        let tasks = TaskTracker::new();
        tasks.spawn(tokio::time::sleep(Duration::from_secs(5)));

        assert!(!signal.drain(&tasks).await);
    }

    #[tokio::test]
    async fn test_drains_share_one_deadline() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(200));
        let first = TaskTracker::new();
        first.spawn(tokio::time::sleep(Duration::from_secs(5)));
        let second = TaskTracker::new();
        second.spawn(tokio::time::sleep(Duration::from_secs(5)));

        let started = Instant::now();
        let deadline = signal.deadline();
        assert!(!signal.drain_until(&first, deadline).await);
        assert!(!signal.drain_until(&second, deadline).await);
        assert!(started.elapsed() < Duration::from_millis(390));
    }
}
