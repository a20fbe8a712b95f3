//! Analytics store over the ClickHouse HTTP interface.
//!
//! Each batch is one `JSONEachRow` insert, so a batch is written whole or not
//! at all. Asynchronous inserts are enabled and ClickHouse buffers them
//! server side.
//!
//! # Example
//!
//! ```rust,ignore
//! use doorwatch::gateway::{AnalyticsStore, AnalyticsTable, ClickhouseStore};
//!
//! let store = ClickhouseStore::new("http://clickhouse:8123", "default")
//!     .with_credentials("default", "secret")
//!     .with_timeout(Duration::from_secs(5));
//! store.append(AnalyticsTable::Plog, vec![record]).await?;
//! ```

use super::{AnalyticsStore, AnalyticsTable, GatewayError, GatewayResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_RETRIES: u32 = 1;

/// Pause before the next attempt after a 5xx or transport error.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// [`AnalyticsStore`] writing to ClickHouse over HTTP.
#[derive(Debug, Clone)]
pub struct ClickhouseStore {
    url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    client: Client,
    timeout: Duration,
    /// Extra attempts on 5xx and transport errors
    retries: u32,
}

impl ClickhouseStore {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            username: None,
            password: None,
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn insert_query(&self, table: AnalyticsTable) -> String {
        format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database,
            table.as_str()
        )
    }

    async fn send_batch(&self, query: &str, body: &str) -> GatewayResult<()> {
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[
                ("async_insert", "1"),
                ("wait_for_async_insert", "0"),
                ("query", query),
            ])
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());

        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "ClickHouse rejected insert");
        Err(GatewayError::Status {
            service: "clickhouse",
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl AnalyticsStore for ClickhouseStore {
    async fn append(&self, table: AnalyticsTable, rows: Vec<Value>) -> GatewayResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let query = self.insert_query(table);
        let body = rows
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");

        let mut attempt = 0;
        loop {
            match self.send_batch(&query, &body).await {
                Ok(()) => {
                    debug!(table = table.as_str(), rows = rows.len(), "Rows appended");
                    return Ok(());
                }
                Err(GatewayError::Status { status, .. }) if status < 500 => {
                    return Err(GatewayError::Status {
                        service: "clickhouse",
                        status,
                    });
                }
                Err(e) if attempt < self.retries => {
                    warn!(error = %e, attempt = attempt, table = table.as_str(), "Retrying ClickHouse insert");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
