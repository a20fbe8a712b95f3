//! Ops HTTP endpoint: `/health` and `/metrics`.

use crate::session::SessionRegistry;
use crate::shutdown::ShutdownSignal;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Service counters.
pub struct Metrics {
    /// UDP datagrams received on every listener
    pub datagrams: AtomicU64,
    /// Datagrams that failed to parse
    pub malformed: AtomicU64,
    /// Lines dropped by a spam filter
    pub spam: AtomicU64,
    /// Rows written to the syslog audit table
    pub audit_rows: AtomicU64,
    /// Enriched records written by the correlator
    pub records: AtomicU64,
    /// Events aborted by a resolution or persistence failure
    pub dropped: AtomicU64,
    /// Stream entries acknowledged
    pub acked: AtomicU64,
    /// Stream entries acknowledged without processing
    pub rejected: AtomicU64,
    /// Stream entries left pending after a failure
    pub failed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            spam: AtomicU64::new(0),
            audit_rows: AtomicU64::new(0),
            records: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn snapshot(&self) -> Value {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        json!({
            "syslog": {
                "datagrams": load(&self.datagrams),
                "malformed": load(&self.malformed),
                "spam": load(&self.spam),
                "audit_rows": load(&self.audit_rows),
            },
            "events": {
                "recorded": load(&self.records),
                "dropped": load(&self.dropped),
            },
            "stream": {
                "acked": load(&self.acked),
                "rejected": load(&self.rejected),
                "failed": load(&self.failed),
            },
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub redis_pool: Pool,
    pub metrics: Arc<Metrics>,
    pub sessions: Arc<SessionRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(Arc::new(state))
}

/// Serve the ops endpoint until shutdown.
pub async fn serve(port: u16, state: AppState, shutdown: ShutdownSignal) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Ops endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    let mut body = state.metrics.snapshot();
    body["version"] = json!(env!("CARGO_PKG_VERSION"));
    body["uptime_seconds"] = json!(uptime);
    body["uptime"] = json!(uptime_str);
    body["sessions"] = json!({
        "live": state.sessions.len(),
        "background_tasks": state.sessions.pending_tasks(),
    });
    body["status"] = json!("running");
    Json(body)
}
