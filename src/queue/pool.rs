//! Bounded consumer pool for one queue.

use super::{Received, TypedQueue};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Back-off multiplier applied to the poll interval after a broker error
const ERROR_BACKOFF_FACTOR: u32 = 8;

/// Processes one leased message; responsible for acking or nacking it
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    /// Handle a delivery
    async fn handle(&self, received: Received<T>);
}

/// Pool sizing and timing
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    /// Messages handled at the same time
    pub concurrency: usize,
    /// Lease requested for each delivery
    pub lease: Duration,
    /// Sleep between polls of an idle queue
    pub poll_interval: Duration,
}

/// Pulls messages from a queue and runs a handler on each, at most
/// `concurrency` at a time.
///
/// A message is only leased once a slot is free, so a busy pool leaves work on the
/// queue for other processes.
pub struct ConsumerPool {
    queue_name: String,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ConsumerPool {
    /// Spawn the poll loop
    pub fn start<T, H>(queue: TypedQueue<T>, handler: Arc<H>, settings: PoolSettings) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let queue_name = queue.name().to_string();

        tasks.spawn(poll_loop(
            queue,
            handler,
            settings,
            cancel.clone(),
            tasks.clone(),
        ));

        tracing::info!(
            queue = %queue_name,
            concurrency = settings.concurrency,
            "consumer pool started"
        );

        Self {
            queue_name,
            cancel,
            tasks,
        }
    }

    /// Queue this pool consumes
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Whether shutdown has been requested
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop leasing new messages and wait for in-flight handlers to finish.
    ///
    /// In-flight work is never interrupted.
    pub async fn shutdown(&self) {
        tracing::info!(queue = %self.queue_name, "consumer pool draining");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(queue = %self.queue_name, "consumer pool stopped");
    }
}

async fn poll_loop<T, H>(
    queue: TypedQueue<T>,
    handler: Arc<H>,
    settings: PoolSettings,
    cancel: CancellationToken,
    tasks: TaskTracker,
) where
    T: Serialize + DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    let slots = Arc::new(Semaphore::new(settings.concurrency.max(1)));

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if cancel.is_cancelled() {
            break;
        }

        match queue.reserve(settings.lease).await {
            Ok(Some(received)) => {
                let handler = handler.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    handler.handle(received).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!(queue = queue.name(), "queue idle");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(queue = queue.name(), error = %e, "failed to reserve message");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.poll_interval * ERROR_BACKOFF_FACTOR) => {}
                }
            }
        }
    }

    tracing::debug!(queue = queue.name(), "poll loop stopped");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::queue::{MemoryQueue, QueueClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowCounter {
        client: Arc<dyn QueueClient>,
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler<u32> for SlowCounter {
        async fn handle(&self, received: Received<u32>) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.client.ack(&received.delivery).await.unwrap();
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(concurrency: usize) -> PoolSettings {
        PoolSettings {
            concurrency,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_drain_waits() {
        let client: Arc<dyn QueueClient> = Arc::new(MemoryQueue::new());
        let queue = TypedQueue::<u32>::new(client.clone(), "q", RetryConfig::default());
        queue.publish(&(0..8).collect::<Vec<_>>()).await.unwrap();

        let handler = Arc::new(SlowCounter {
            client: client.clone(),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let pool = ConsumerPool::start(queue.clone(), handler.clone(), settings(2));

        // Let it pick up work, then drain
        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.shutdown().await;

        assert!(pool.is_stopping());
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(handler.running.load(Ordering::SeqCst), 0, "drain waits for in-flight work");

        // Whatever was not started is still on the queue
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(
            stats.waiting as usize + handler.done.load(Ordering::SeqCst),
            8
        );
    }

    #[tokio::test]
    async fn test_processes_everything_when_left_running() {
        let client: Arc<dyn QueueClient> = Arc::new(MemoryQueue::new());
        let queue = TypedQueue::<u32>::new(client.clone(), "q", RetryConfig::default());
        queue.publish(&[1, 2, 3]).await.unwrap();

        let handler = Arc::new(SlowCounter {
            client,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let pool = ConsumerPool::start(queue.clone(), handler.clone(), settings(4));

        for _ in 0..100 {
            if handler.done.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        assert_eq!(handler.done.load(Ordering::SeqCst), 3);
    }
}
