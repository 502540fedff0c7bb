//! In-process queue with the same lease and redelivery rules as the SQLite broker.

use super::{Delivery, QueueClient, Redelivery};
use crate::config::RetryConfig;
use crate::error::QueueError;
use crate::retry::backoff_delay;
use crate::types::{JobHandle, QueueStats};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageState {
    Waiting,
    Active,
    Failed,
}

#[derive(Debug)]
struct StoredMessage {
    payload: String,
    state: MessageState,
    attempts: u32,
    policy: RetryConfig,
    visible_at: Instant,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, BTreeMap<i64, StoredMessage>>,
    next_id: i64,
    enqueue_calls: usize,
    /// Batches still accepted before enqueues start failing
    accept_batches: Option<usize>,
}

/// Queue held in process memory
///
/// Messages do not survive the process. Useful as a test double and for running
/// the whole pipeline inside one process.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    /// Create an empty queue set
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `batches` more `enqueue_batch` calls, then report the broker unavailable
    pub async fn fail_enqueues_after(&self, batches: usize) {
        self.inner.lock().await.accept_batches = Some(batches);
    }

    /// Accept enqueues again
    pub async fn restore(&self) {
        self.inner.lock().await.accept_batches = None;
    }

    /// Number of `enqueue_batch` calls seen, failed ones included
    pub async fn enqueue_calls(&self) -> usize {
        self.inner.lock().await.enqueue_calls
    }

    /// Last error recorded for a message, if the message still exists
    pub async fn last_error(&self, queue: &str, id: i64) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(queue)
            .and_then(|messages| messages.get(&id))
            .and_then(|message| message.last_error.clone())
    }

    fn leased<'a>(
        inner: &'a mut Inner,
        delivery: &Delivery,
    ) -> Result<&'a mut StoredMessage, QueueError> {
        inner
            .queues
            .get_mut(&delivery.queue)
            .and_then(|messages| messages.get_mut(&delivery.id))
            .filter(|message| {
                message.state == MessageState::Active && message.attempts == delivery.attempt
            })
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                id: delivery.id,
            })
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<String>,
        policy: &RetryConfig,
    ) -> Result<Vec<JobHandle>, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.enqueue_calls += 1;

        if let Some(remaining) = inner.accept_batches.as_mut() {
            if *remaining == 0 {
                return Err(QueueError::Unavailable(format!(
                    "queue {} is not accepting messages",
                    queue
                )));
            }
            *remaining -= 1;
        }

        let now = Instant::now();
        let mut handles = Vec::with_capacity(payloads.len());
        for payload in payloads {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.queues.entry(queue.to_string()).or_default().insert(
                id,
                StoredMessage {
                    payload,
                    state: MessageState::Waiting,
                    attempts: 0,
                    policy: policy.clone(),
                    visible_at: now,
                    last_error: None,
                },
            );
            handles.push(JobHandle {
                queue: queue.to_string(),
                id,
            });
        }

        Ok(handles)
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let Some(messages) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        // Expired leases are visible again, like waiting messages whose backoff elapsed
        let next = messages
            .iter()
            .filter(|(_, m)| m.state != MessageState::Failed && m.visible_at <= now)
            .min_by_key(|(id, m)| (m.visible_at, **id))
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(message) = messages.get_mut(&id) else {
            return Ok(None);
        };

        message.state = MessageState::Active;
        message.attempts += 1;
        message.visible_at = now + lease;

        Ok(Some(Delivery {
            id,
            queue: queue.to_string(),
            payload: message.payload.clone(),
            attempt: message.attempts,
            policy: message.policy.clone(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        Self::leased(&mut inner, delivery)?;
        if let Some(messages) = inner.queues.get_mut(&delivery.queue) {
            messages.remove(&delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<Redelivery, QueueError> {
        let mut inner = self.inner.lock().await;
        let message = Self::leased(&mut inner, delivery)?;
        message.last_error = Some(error.to_string());

        if message.attempts >= message.policy.max_attempts {
            message.state = MessageState::Failed;
            message.visible_at = Instant::now();
            return Ok(Redelivery::Exhausted);
        }

        let delay = backoff_delay(&message.policy, message.attempts);
        message.state = MessageState::Waiting;
        message.visible_at = Instant::now() + delay;
        Ok(Redelivery::Scheduled { delay })
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = Self::leased(&mut inner, delivery)?;
        message.state = MessageState::Failed;
        message.visible_at = Instant::now();
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        if let Some(messages) = inner.queues.get(queue) {
            for message in messages.values() {
                match message.state {
                    MessageState::Waiting => stats.waiting += 1,
                    MessageState::Active => stats.active += 1,
                    MessageState::Failed => stats.failed += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn purge_failed(&self, queue: &str, older_than: Duration) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let Some(messages) = inner.queues.get_mut(queue) else {
            return Ok(0);
        };

        let before = messages.len();
        messages.retain(|_, m| {
            m.state != MessageState::Failed || now.duration_since(m.visible_at) < older_than
        });
        Ok((before - messages.len()) as u64)
    }
}
