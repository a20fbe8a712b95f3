//! doorwatch - intercom event service
//!
//! Binds one UDP syslog listener per configured vendor, consumes the door
//! event stream and exposes `/health` and `/metrics`.
//!
//! ## Configuration
//!
//! - `DOORWATCH_CONFIG`: path to the TOML config (default: `config/doorwatch.toml`)
//! - `RUST_LOG`: log filter (default: "info")
//!
//! Secrets are usually injected through `${VAR}` references in the config
//! file; a `.env` file is loaded first when present.

use deadpool_redis::{Config, PoolConfig, Runtime};
use doorwatch::config::{DoorwatchConfig, LogFormat};
use doorwatch::gateway::{
    ClickhouseStore, FrsClient, Gateways, HttpImageSource, PgDirectory, PushClient, S3BlobStore,
};
use doorwatch::http::{self, AppState, Metrics};
use doorwatch::listener::SyslogListener;
use doorwatch::queue::{ProcessorSettings, QueueProcessor, RedisStreamQueue};
use doorwatch::shutdown::ShutdownSignal;
use doorwatch::{Correlator, SessionRegistry, SyslogRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Consumer name prefix: configured, else the hostname, else a UUID.
fn consumer_prefix(config: &DoorwatchConfig) -> String {
    if let Some(prefix) = &config.stream.consumer_prefix {
        return prefix.clone();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return name.to_string();
        }
    }

    format!("doorwatch-{}", uuid::Uuid::new_v4())
}

async fn build_gateways(config: &DoorwatchConfig) -> Result<Gateways, Box<dyn std::error::Error>> {
    let directory = PgDirectory::connect(&config.postgres).await?;
    let blobs = S3BlobStore::new(&config.s3).await;

    let mut analytics = ClickhouseStore::new(&config.clickhouse.url, &config.clickhouse.database)
        .with_timeout(Duration::from_millis(config.clickhouse.timeout_ms))
        .with_retries(config.clickhouse.retries);
    if let Some(username) = &config.clickhouse.username {
        analytics = analytics.with_credentials(
            username,
            config.clickhouse.password.clone().unwrap_or_default(),
        );
    }

    let mut frs = FrsClient::new()
        .with_token(&config.frs.token)
        .with_timeout(Duration::from_millis(config.frs.timeout_ms));
    if let Some(offset) = config.frs.utc_offset() {
        frs = frs.with_utc_offset(offset);
    }
    let images = HttpImageSource::new(&config.rbt.internal_api)
        .with_timeout(Duration::from_millis(config.rbt.timeout_ms));
    let push = PushClient::new(&config.push.url, &config.push.secret)
        .with_ttl(config.push.ttl_secs)
        .with_timeout(Duration::from_millis(config.push.timeout_ms));

    Ok(Gateways {
        directory: Arc::new(directory),
        blobs: Arc::new(blobs),
        analytics: Arc::new(analytics),
        frs: Arc::new(frs),
        images: Arc::new(images),
        push: Arc::new(push),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = DoorwatchConfig::load()?;
    init_tracing(config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listeners = config.listeners.len(),
        "doorwatch starting"
    );

    // Redis pool, shared by the queue and the health check
    let mut redis = Config::from_url(&config.redis.url);
    redis.pool = Some(PoolConfig::new(config.redis.pool_size));
    let pool = redis.create_pool(Some(Runtime::Tokio1))?;

    let gateways = build_gateways(&config).await?;
    let metrics = Arc::new(Metrics::new());
    let correlator = Correlator::new(gateways.clone());
    let sessions = Arc::new(SessionRegistry::new(
        gateways.clone(),
        config.sessions.screenshot_wait(),
    ));

    let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(config.shutdown.timeout_secs));
    let tasks = TaskTracker::new();

    // Syslog listeners. A port we cannot bind is fatal.
    for listener_config in &config.listeners {
        let router = SyslogRouter::new(
            listener_config,
            gateways.analytics.clone(),
            correlator.clone(),
            sessions.clone(),
            metrics.clone(),
        );
        let listener = SyslogListener::bind(listener_config.port, router)
            .await
            .map_err(|e| {
                error!(
                    vendor = %listener_config.vendor,
                    port = listener_config.port,
                    error = %e,
                    "Failed to bind syslog listener"
                );
                e
            })?;
        tasks.spawn(listener.run(tasks.clone(), shutdown.clone()));
    }

    // Door event stream
    let queue = RedisStreamQueue::new(pool.clone(), &config.stream.name, &config.stream.group);
    let settings = ProcessorSettings::from_config(&config.stream, consumer_prefix(&config));
    let processor = QueueProcessor::new(
        Arc::new(queue),
        Arc::new(correlator.clone()),
        settings,
        metrics.clone(),
    );
    processor.start(&tasks, &shutdown).await?;

    tasks.spawn(sessions.clone().run_sweeper(
        config.sessions.sweep_interval(),
        config.sessions.session_ttl(),
        shutdown.clone(),
    ));

    if config.http.port != 0 {
        let state = AppState {
            redis_pool: pool.clone(),
            metrics: metrics.clone(),
            sessions: sessions.clone(),
        };
        let port = config.http.port;
        let http_shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = http::serve(port, state, http_shutdown).await {
                error!(port = port, error = %e, "Ops endpoint failed");
            }
        });
    }

    info!(stream = %config.stream.name, group = %config.stream.group, "doorwatch running");

    shutdown.wait().await;

    // listeners and workers first, then call sessions, within one timeout
    let deadline = shutdown.deadline();
    let drained = shutdown.drain_until(&tasks, deadline).await;
    let sessions_drained = sessions.shutdown(deadline).await;
    if !drained || !sessions_drained {
        warn!("Some tasks were abandoned at shutdown");
    }

    info!("doorwatch stopped");
    Ok(())
}
