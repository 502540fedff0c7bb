//! Durable message queue abstraction
//!
//! The pipeline's components talk to each other only through queues. A queue is
//! durable, roughly FIFO, and delivers at least once: a consumer leases a message
//! with [`QueueClient::reserve`], and the message comes back if the lease expires
//! before it is acknowledged.
//!
//! Every message carries the [`RetryConfig`] it was published with. Negative
//! acknowledgements reschedule the message with exponential backoff until its
//! attempt budget is spent, after which it is parked in the `failed` state.
//! Parked messages are kept for inspection and replay until the retention sweep
//! ([`spawn_failed_sweep`]) purges them.
//!
//! Implementations:
//! - [`Database`](crate::db::Database): SQLite tables, shared between processes
//! - [`MemoryQueue`]: in-process, for tests and single-process embedding

use crate::config::RetryConfig;
use crate::error::QueueError;
use crate::types::{JobHandle, QueueStats};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

mod memory;
mod pool;
mod retention;

pub use memory::MemoryQueue;
pub use pool::{ConsumerPool, MessageHandler, PoolSettings};
pub use retention::{purge_failed_messages, spawn_failed_sweep};

/// A leased message
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Broker-assigned message ID
    pub id: i64,
    /// Queue the message was leased from
    pub queue: String,
    /// Raw JSON payload
    pub payload: String,
    /// 1-based delivery count, this delivery included
    pub attempt: u32,
    /// Redelivery policy the message was published with
    pub policy: RetryConfig,
}

impl Delivery {
    /// Whether a negative acknowledgement would exhaust the message
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Decode the payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.payload).map_err(|e| QueueError::InvalidMessage {
            queue: self.queue.clone(),
            reason: e.to_string(),
        })
    }

    /// Handle identifying this message
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            queue: self.queue.clone(),
            id: self.id,
        }
    }
}

/// What a negative acknowledgement did to the message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redelivery {
    /// The message becomes visible again after `delay`
    Scheduled {
        /// Backoff before the next delivery
        delay: Duration,
    },
    /// The attempt budget is spent; the message moved to `failed`
    Exhausted,
}

/// Durable at-least-once queue
///
/// `ack`, `nack` and `dead_letter` only act on the lease identified by
/// `(delivery.id, delivery.attempt)`. Once a lease has expired and the message was
/// handed to another consumer, the stale holder gets [`QueueError::UnknownDelivery`].
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Append JSON payloads to a queue, all or nothing.
    ///
    /// Handles are returned in payload order.
    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<String>,
        policy: &RetryConfig,
    ) -> Result<Vec<JobHandle>, QueueError>;

    /// Lease the oldest visible message for `lease`, or `None` if the queue is idle.
    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a processed message
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a message for redelivery with backoff, or park it once its attempts
    /// are used up. `error` is kept as the message's last error.
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<Redelivery, QueueError>;

    /// Park a message in `failed` without further attempts
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Message counts per state
    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Delete messages parked in `failed` for at least `older_than`.
    ///
    /// Returns how many were deleted.
    async fn purge_failed(&self, queue: &str, older_than: Duration) -> Result<u64, QueueError>;
}

/// A decoded delivery
#[derive(Debug)]
pub struct Received<T> {
    /// The lease, needed to ack or nack
    pub delivery: Delivery,
    /// Decoded message body
    pub message: T,
}

/// A named queue carrying one message type
pub struct TypedQueue<T> {
    client: Arc<dyn QueueClient>,
    name: String,
    policy: RetryConfig,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            name: self.name.clone(),
            policy: self.policy.clone(),
            _message: PhantomData,
        }
    }
}

impl<T> TypedQueue<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Bind a queue name and publish policy to a client
    pub fn new(client: Arc<dyn QueueClient>, name: impl Into<String>, policy: RetryConfig) -> Self {
        Self {
            client,
            name: name.into(),
            policy,
            _message: PhantomData,
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying client
    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Encode and publish messages as one atomic batch
    pub async fn publish(&self, messages: &[T]) -> Result<Vec<JobHandle>, QueueError> {
        let payloads = messages
            .iter()
            .map(|message| {
                serde_json::to_string(message).map_err(|e| QueueError::InvalidMessage {
                    queue: self.name.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.client
            .enqueue_batch(&self.name, payloads, &self.policy)
            .await
    }

    /// Lease and decode the next message.
    ///
    /// Undecodable messages are dead-lettered and skipped; retrying them cannot help.
    pub async fn reserve(&self, lease: Duration) -> Result<Option<Received<T>>, QueueError> {
        loop {
            let Some(delivery) = self.client.reserve(&self.name, lease).await? else {
                return Ok(None);
            };

            match delivery.decode::<T>() {
                Ok(message) => return Ok(Some(Received { delivery, message })),
                Err(e) => {
                    tracing::error!(
                        queue = %self.name,
                        message_id = delivery.id,
                        error = %e,
                        "dropping undecodable message"
                    );
                    self.client.dead_letter(&delivery, &e.to_string()).await?;
                }
            }
        }
    }

    /// Message counts per state
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.client.stats(&self.name).await
    }
}
