//! Configuration module for doorwatch.
//!
//! Loads configuration from a TOML file with environment variable
//! substitution. Every section is optional and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [stream]
//! name = "door_open_events_stream"
//! workers = 4
//!
//! [clickhouse]
//! url = "http://clickhouse:8123"
//! password = "${CLICKHOUSE_PASSWORD}"
//!
//! [[listeners]]
//! vendor = "beward"
//! port = 45450
//! spam_words = ["SIP registration", "NTP"]
//! ```

use crate::syslog::Framing;
use chrono::FixedOffset;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct DoorwatchConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,

    #[serde(default)]
    pub clickhouse: ClickhouseConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub frs: FrsConfig,

    #[serde(default)]
    pub rbt: RbtConfig,

    #[serde(default)]
    pub push: PushConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// One UDP listener per intercom vendor family
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,
}

impl Default for DoorwatchConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            redis: RedisConfig::default(),
            stream: StreamConfig::default(),
            postgres: PostgresConfig::default(),
            clickhouse: ClickhouseConfig::default(),
            s3: S3Config::default(),
            frs: FrsConfig::default(),
            rbt: RbtConfig::default(),
            push: PushConfig::default(),
            sessions: SessionConfig::default(),
            shutdown: ShutdownConfig::default(),
            listeners: default_listeners(),
        }
    }
}

/// Ops HTTP endpoint configuration. Port 0 disables the endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

/// Door event stream consumption
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_name")]
    pub name: String,

    #[serde(default = "default_consumer_group")]
    pub group: String,

    /// Prefix for consumer names; defaults to the hostname
    #[serde(default)]
    pub consumer_prefix: Option<String>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Idle time after which a pending message may be reclaimed
    #[serde(default = "default_pending_min_idle_ms")]
    pub pending_min_idle_ms: u64,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    #[serde(default = "default_claim_count")]
    pub claim_count: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            group: default_consumer_group(),
            consumer_prefix: None,
            workers: default_workers(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            pending_min_idle_ms: default_pending_min_idle_ms(),
            recovery_interval_ms: default_recovery_interval_ms(),
            claim_count: default_claim_count(),
        }
    }
}

impl StreamConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn pending_min_idle(&self) -> Duration {
        Duration::from_millis(self.pending_min_idle_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

fn default_stream_name() -> String {
    crate::EVENT_STREAM_NAME.to_string()
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    5000
}

fn default_pending_min_idle_ms() -> u64 {
    60_000
}

fn default_recovery_interval_ms() -> u64 {
    10_000
}

fn default_claim_count() -> usize {
    10
}

/// Directory database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_postgres_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: default_postgres_url(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_postgres_url() -> String {
    "postgres://localhost:5432/rbt".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retries() -> u32 {
    1
}

/// Analytics store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ClickhouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,

    #[serde(default = "default_clickhouse_database")]
    pub database: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_database(),
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

/// Screenshot blob storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for MinIO and other S3-compatible stores
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,

    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            prefix: default_prefix(),
        }
    }
}

fn default_bucket() -> String {
    "doorwatch".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "camshots".to_string()
}

/// Face-recognition client configuration. Endpoints come from each camera.
#[derive(Debug, Deserialize, Clone)]
pub struct FrsConfig {
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Offset of the wall clock FRS indexes frames by, in minutes east of UTC
    #[serde(default = "default_frs_utc_offset")]
    pub utc_offset_minutes: i32,
}

impl Default for FrsConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            timeout_ms: default_timeout_ms(),
            utc_offset_minutes: default_frs_utc_offset(),
        }
    }
}

impl FrsConfig {
    /// `None` when the offset is a day or more.
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }
}

fn default_frs_utc_offset() -> i32 {
    180
}

/// Backend internal API, used for camera snapshots
#[derive(Debug, Deserialize, Clone)]
pub struct RbtConfig {
    #[serde(default = "default_internal_api")]
    pub internal_api: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RbtConfig {
    fn default() -> Self {
        Self {
            internal_api: default_internal_api(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_internal_api() -> String {
    "http://localhost/internal".to_string()
}

/// Push gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_push_url")]
    pub url: String,

    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_push_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: default_push_url(),
            secret: String::new(),
            ttl_secs: default_push_ttl(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_push_url() -> String {
    "http://localhost/isdn".to_string()
}

fn default_push_ttl() -> u64 {
    30
}

/// Call session bookkeeping
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Ceiling the finalizer waits for a session's screenshot
    #[serde(default = "default_screenshot_wait_ms")]
    pub screenshot_wait_ms: u64,

    /// Sessions older than this are swept even without a terminal message
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            screenshot_wait_ms: default_screenshot_wait_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn screenshot_wait(&self) -> Duration {
        Duration::from_millis(self.screenshot_wait_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_screenshot_wait_ms() -> u64 {
    5000
}

fn default_session_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// UDP syslog listener for one vendor family
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ListenerConfig {
    /// Tag written to the `unit` column of audit rows
    pub vendor: String,

    pub port: u16,

    #[serde(default)]
    pub framing: Framing,

    /// Lines containing any of these substrings are dropped silently
    #[serde(default)]
    pub spam_words: Vec<String>,
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        vendor: "beward".to_string(),
        port: 45450,
        framing: Framing::Standard,
        spam_words: Vec::new(),
    }]
}

impl DoorwatchConfig {
    /// Load configuration from the default path or DOORWATCH_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("DOORWATCH_CONFIG").unwrap_or_else(|_| "config/doorwatch.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: DoorwatchConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            listeners = config.listeners.len(),
            workers = config.stream.workers,
            stream = %config.stream.name,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::MissingField("listeners".to_string()));
        }

        let mut ports = HashSet::new();
        for listener in &self.listeners {
            if listener.vendor.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Listener on port {} has an empty vendor",
                    listener.port
                )));
            }
            if !ports.insert(listener.port) {
                return Err(ConfigError::ValidationError(format!(
                    "Port {} is bound by more than one listener",
                    listener.port
                )));
            }
        }

        if self.stream.workers == 0 {
            return Err(ConfigError::ValidationError(
                "stream.workers must be at least 1".to_string(),
            ));
        }
        if self.stream.batch_size == 0 || self.stream.claim_count == 0 {
            return Err(ConfigError::ValidationError(
                "stream.batch_size and stream.claim_count must be at least 1".to_string(),
            ));
        }

        if self.frs.utc_offset().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "frs.utc_offset_minutes {} is out of range",
                self.frs.utc_offset_minutes
            )));
        }

        for (name, url) in [
            ("clickhouse.url", &self.clickhouse.url),
            ("rbt.internal_api", &self.rbt.internal_api),
            ("push.url", &self.push.url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        for (name, value) in [
            ("redis.url", &self.redis.url),
            ("postgres.url", &self.postgres.url),
            ("frs.token", &self.frs.token),
            ("push.secret", &self.push.secret),
        ] {
            if value.contains("${") {
                warn!(
                    field = name,
                    "Configuration value contains unsubstituted environment variable"
                );
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
