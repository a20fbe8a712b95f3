//! doorwatch-publisher - synthetic door event load generator
//!
//! Publishes random canonical door events to the event stream so the queue
//! path can be exercised without a backend.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: "redis://localhost:6379")
//! - `PUBLISH_STREAM`: stream name (default: "door_open_events_stream")
//! - `PUBLISH_MODE`: "steady" or "batch" (default: "batch")
//! - `PUBLISH_RATE`: messages per second (steady) or per batch (batch), default 50
//! - `PUBLISH_INTERVAL_SECS`: pause between batches (default: 5)
//! - `PUBLISH_IPS`: comma-separated domophone addresses
//! - `RUST_LOG`: Logging level (default: "info")

use chrono::Utc;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use doorwatch::event::DoorEvent;
use doorwatch::queue::PAYLOAD_FIELD;
use doorwatch::shutdown::ShutdownSignal;
use doorwatch::EVENT_STREAM_NAME;
use rand::seq::SliceRandom;
use rand::Rng;
use std::env;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_IPS: &[&str] = &[
    "192.168.1.100",
    "192.168.1.101",
    "192.168.1.102",
    "192.168.1.103",
    "192.168.1.104",
    "192.168.1.105",
];

/// Event codes the publisher draws from. 1 and 2 are not accepted by the
/// consumer and exercise the reject path.
const EVENT_TYPES: &[i32] = &[1, 2, 3, 4, 5, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// `rate` messages per second, evenly spaced
    Steady,
    /// `rate` messages at once, every `interval`
    Batch,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "steady" => Ok(Mode::Steady),
            "batch" => Ok(Mode::Batch),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

struct Settings {
    stream: String,
    mode: Mode,
    rate: u32,
    interval: Duration,
    ips: Vec<String>,
}

impl Settings {
    fn from_env() -> Result<Self, String> {
        let mode = env::var("PUBLISH_MODE")
            .map(|m| m.parse())
            .unwrap_or(Ok(Mode::Batch))?;
        let rate = env_number("PUBLISH_RATE", 50)?.max(1) as u32;
        let interval = Duration::from_secs(env_number("PUBLISH_INTERVAL_SECS", 5)?.max(1));
        let ips = match env::var("PUBLISH_IPS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => DEFAULT_IPS.iter().map(|ip| ip.to_string()).collect(),
        };

        Ok(Self {
            stream: env::var("PUBLISH_STREAM").unwrap_or_else(|_| EVENT_STREAM_NAME.to_string()),
            mode,
            rate,
            interval,
            ips,
        })
    }
}

fn env_number(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| format!("{name} must be a number, got {value:?}")),
        Err(_) => Ok(default),
    }
}

/// Build one random event with a detail that fits its kind.
fn generate_event<R: Rng>(rng: &mut R, ips: &[String]) -> DoorEvent {
    let event_type = *EVENT_TYPES.choose(rng).unwrap_or(&6);
    let detail = match event_type {
        3 => (0..14)
            .map(|_| format!("{:X}", rng.gen_range(0..16u8)))
            .collect(),
        4 => format!("7900{:07}", rng.gen_range(0..10_000_000u32)),
        5 => format!("{}|{}", rng.gen_range(1..500u32), uuid::Uuid::new_v4()),
        6 => rng.gen_range(1000..100_000u32).to_string(),
        _ => String::new(),
    };

    DoorEvent {
        date: Utc::now().timestamp() - rng.gen_range(0..60i64),
        domophone_id: None,
        ip: ips.choose(rng).cloned().unwrap_or_default(),
        sub_id: rng.gen_bool(0.7).then(|| rng.gen_range(1..=1000i64)),
        event_type,
        door: rng.gen_range(0..2),
        detail,
    }
}

async fn publish(pool: &Pool, settings: &Settings) -> Result<String, Box<dyn std::error::Error>> {
    let event = generate_event(&mut rand::thread_rng(), &settings.ips);
    let payload = serde_json::to_string(&event)?;

    let mut conn = pool.get().await?;
    let id: String = cmd("XADD")
        .arg(&settings.stream)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query_async(&mut conn)
        .await?;
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    let tick = match settings.mode {
        Mode::Steady => Duration::from_secs(1) / settings.rate,
        Mode::Batch => settings.interval,
    };
    let per_tick = match settings.mode {
        Mode::Steady => 1,
        Mode::Batch => settings.rate,
    };

    info!(
        stream = %settings.stream,
        mode = ?settings.mode,
        rate = settings.rate,
        tick_ms = tick.as_millis() as u64,
        "Publisher starting"
    );

    let mut ticker = tokio::time::interval(tick);
    let started = Instant::now();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut batch = 0;
        for _ in 0..per_tick {
            match publish(&pool, &settings).await {
                Ok(_) => batch += 1,
                Err(e) => error!(error = %e, "Failed to publish event"),
            }
        }
        sent += batch;

        let report = match settings.mode {
            Mode::Steady => batch > 0 && sent % 10 == 0,
            Mode::Batch => true,
        };
        if report {
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                sent = sent,
                batch = batch,
                rate = %format!("{:.1} msg/s", sent as f64 / elapsed.max(0.001)),
                "Progress"
            );
        }
    }

    info!(total = sent, "Publisher stopped");
    Ok(())
}
