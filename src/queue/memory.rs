//! In-process stream with consumer-group semantics, for tests.

use super::{QueueError, QueueMessage, StreamQueue, PAYLOAD_FIELD};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Pending {
    consumer: String,
    delivered_at: Instant,
    message: QueueMessage,
}

#[derive(Default)]
struct State {
    entries: Vec<QueueMessage>,
    /// Index of the next never-delivered entry
    cursor: usize,
    pending: HashMap<String, Pending>,
    group_created: bool,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with `payload`, returning its id.
    pub fn publish(&self, payload: &str) -> String {
        let mut state = self.state.lock();
        let id = format!("{}-0", state.entries.len() + 1);
        state.entries.push(QueueMessage {
            id: id.clone(),
            fields: HashMap::from([(PAYLOAD_FIELD.to_string(), payload.to_string())]),
        });
        id
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn pending_owner(&self, id: &str) -> Option<String> {
        self.state.lock().pending.get(id).map(|p| p.consumer.clone())
    }

    pub fn group_created(&self) -> bool {
        self.state.lock().group_created
    }

    fn deliver(&self, consumer: &str, count: usize) -> Vec<QueueMessage> {
        let mut state = self.state.lock();
        let end = (state.cursor + count).min(state.entries.len());
        let batch: Vec<QueueMessage> = state.entries[state.cursor..end].to_vec();
        state.cursor = end;

        let now = Instant::now();
        for message in &batch {
            state.pending.insert(
                message.id.clone(),
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    message: message.clone(),
                },
            );
        }
        batch
    }
}

#[async_trait]
impl StreamQueue for MemoryQueue {
    async fn ensure_group(&self) -> Result<(), QueueError> {
        self.state.lock().group_created = true;
        Ok(())
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let batch = self.deliver(consumer, count);
        if !batch.is_empty() || block.is_zero() {
            return Ok(batch);
        }

        tokio::time::sleep(block).await;
        Ok(self.deliver(consumer, count))
    }

    async fn ack(&self, ids: &[String]) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(id.as_str()).is_some())
            .count() as u64)
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let mut idle: Vec<&mut Pending> = state
            .pending
            .values_mut()
            .filter(|p| now.duration_since(p.delivered_at) >= min_idle)
            .collect();
        idle.sort_by(|a, b| a.message.id.cmp(&b.message.id));

        Ok(idle
            .into_iter()
            .take(count)
            .map(|p| {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.message.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_ack_is_noop() {
        let queue = MemoryQueue::new();
        let id = queue.publish("{}");
        queue.read_group("w", 10, Duration::ZERO).await.unwrap();

        assert_eq!(queue.ack(&[id.clone()]).await.unwrap(), 1);
        assert_eq!(queue.ack(&[id]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_respects_idle_threshold() {
        let queue = MemoryQueue::new();
        let id = queue.publish("{}");
        queue.read_group("w", 10, Duration::ZERO).await.unwrap();

        let claimed = queue
            .claim_idle("rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(queue.pending_owner(&id).as_deref(), Some("w"));

        let claimed = queue.claim_idle("rescuer", Duration::ZERO, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.pending_owner(&id).as_deref(), Some("rescuer"));
    }

    #[tokio::test]
    async fn test_entries_delivered_once() {
        let queue = MemoryQueue::new();
        queue.publish("a");
        queue.publish("b");
        queue.publish("c");

        let first = queue.read_group("w1", 2, Duration::ZERO).await.unwrap();
        let second = queue.read_group("w2", 2, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload(), Some("c"));
        assert!(queue
            .read_group("w1", 2, Duration::from_millis(5))
            .await
            .unwrap()
            .is_empty());
    }
}
