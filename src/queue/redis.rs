//! Redis Streams implementation of [`StreamQueue`].

use super::{QueueError, QueueMessage, StreamQueue};
use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Consumer group on one Redis stream.
#[derive(Clone)]
pub struct RedisStreamQueue {
    pool: Pool,
    stream: String,
    group: String,
}

impl RedisStreamQueue {
    pub fn new(pool: Pool, stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
            group: group.into(),
        }
    }
}

#[async_trait]
impl StreamQueue for RedisStreamQueue {
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;

        // The stream itself is created by the publisher, hence no MKSTREAM.
        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.pool.get().await?;

        let mut opts = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count);
        // BLOCK 0 would wait forever
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| QueueMessage {
                id: entry.id,
                fields: entry
                    .map
                    .iter()
                    .filter_map(|(k, v)| value_to_string(v).map(|v| (k.clone(), v)))
                    .collect(),
            })
            .collect())
    }

    async fn ack(&self, ids: &[String]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let acked: u64 = conn.xack(&self.stream, &self.group, ids).await?;
        Ok(acked)
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.pool.get().await?;

        // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let messages = parse_autoclaim(reply)?;
        debug!(consumer = %consumer, count = messages.len(), "XAUTOCLAIM finished");
        Ok(messages)
    }
}

/// Parse an XAUTOCLAIM reply: `[next-cursor, [[id, [field, value, ...]], ...], deleted?]`.
///
/// Entries deleted from the stream while pending come back as nil on older
/// servers and are skipped.
fn parse_autoclaim(reply: RedisValue) -> Result<Vec<QueueMessage>, QueueError> {
    let parts = match reply {
        RedisValue::Array(parts) => parts,
        other => {
            return Err(QueueError::Malformed(format!(
                "XAUTOCLAIM returned {other:?}"
            )))
        }
    };

    let Some(RedisValue::Array(entries)) = parts.into_iter().nth(1) else {
        return Err(QueueError::Malformed(
            "XAUTOCLAIM reply has no entry list".to_string(),
        ));
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let RedisValue::Array(mut pair) = entry else {
            continue;
        };
        if pair.len() != 2 {
            return Err(QueueError::Malformed(format!(
                "stream entry has {} elements",
                pair.len()
            )));
        }

        let fields = pair.pop();
        let id = pair
            .pop()
            .as_ref()
            .and_then(value_to_string)
            .ok_or_else(|| QueueError::Malformed("stream entry without id".to_string()))?;

        let fields = match fields {
            Some(RedisValue::Array(flat)) => flat
                .chunks(2)
                .filter_map(|kv| match kv {
                    [k, v] => Some((value_to_string(k)?, value_to_string(v)?)),
                    _ => None,
                })
                .collect(),
            _ => HashMap::new(),
        };

        messages.push(QueueMessage { id, fields });
    }

    Ok(messages)
}

fn value_to_string(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        RedisValue::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::{Config, Runtime};

    fn bulk(s: &str) -> RedisValue {
        RedisValue::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = RedisValue::Array(vec![
            bulk("0-0"),
            RedisValue::Array(vec![
                RedisValue::Array(vec![
                    bulk("1700000000000-0"),
                    RedisValue::Array(vec![bulk("payload"), bulk("{\"event_type\":6}")]),
                ]),
                RedisValue::Nil,
            ]),
            RedisValue::Array(vec![]),
        ]);

        let messages = parse_autoclaim(reply).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "1700000000000-0");
        assert_eq!(messages[0].payload(), Some("{\"event_type\":6}"));
    }

    #[test]
    fn test_parse_autoclaim_empty_and_malformed() {
        let empty = RedisValue::Array(vec![bulk("0-0"), RedisValue::Array(vec![])]);
        assert!(parse_autoclaim(empty).unwrap().is_empty());

        assert!(matches!(
            parse_autoclaim(RedisValue::Nil),
            Err(QueueError::Malformed(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_redis_group_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1)).unwrap();
        let stream = format!("doorwatch_test_{}", uuid::Uuid::new_v4());
        let queue = RedisStreamQueue::new(pool.clone(), &stream, "doorwatch_test");

        let mut conn = pool.get().await.unwrap();
        let id: String = cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("payload")
            .arg("{}")
            .query_async(&mut conn)
            .await
            .unwrap();

        queue.ensure_group().await.unwrap();
        queue.ensure_group().await.unwrap();

        let messages = queue.read_group("w", 10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);

        let idle = queue.claim_idle("rescuer", Duration::from_secs(60), 10).await.unwrap();
        assert!(idle.is_empty());
        let claimed = queue.claim_idle("rescuer", Duration::ZERO, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        assert_eq!(queue.ack(&[id.clone()]).await.unwrap(), 1);
        assert_eq!(queue.ack(&[id]).await.unwrap(), 0);

        let _: () = cmd("DEL").arg(&stream).query_async(&mut conn).await.unwrap();
    }
}
