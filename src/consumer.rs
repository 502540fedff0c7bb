//! Result consumer
//!
//! Applies [`JobResult`] messages to their media records and reports each processed
//! item to the [`CompletionTracker`]. Failed downloads count as processed too.
//!
//! Results for unknown media are logged and dropped. Store and counter errors nack
//! the result so the broker redelivers it; both steps are idempotent, so replaying
//! a result that was half-applied is safe. Results follow their own, longer
//! redelivery policy (`Config::result_retry`). One that still runs out of attempts
//! stays parked on the result queue and is logged with its media ID for replay.

use crate::completion::{CompletionTracker, Progress};
use crate::config::Config;
use crate::db::{Database, MediaSettlement};
use crate::error::Result;
use crate::queue::{
    ConsumerPool, MessageHandler, PoolSettings, QueueClient, Received, Redelivery, TypedQueue,
};
use crate::types::{JobOutcome, JobResult, MediaId, PackageId};
use async_trait::async_trait;
use std::sync::Arc;

/// What happened to one result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultOutcome {
    /// No media record with the result's ID; nothing changed
    UnknownMedia,
    /// The result was applied, or had been applied before
    Processed {
        /// Owning package
        package_id: PackageId,
        /// False when the media record was already terminal
        settled: bool,
        /// Completion tracker outcome
        progress: Progress,
    },
}

/// Public reference for a stored file, served by the `/files` route
pub fn public_file_url(file_server_uri: &str, media_id: MediaId) -> String {
    format!("{}/files/{}", file_server_uri.trim_end_matches('/'), media_id)
}

/// Applies results to the media store
#[derive(Clone)]
pub struct ResultProcessor {
    db: Arc<Database>,
    tracker: CompletionTracker,
    file_server_uri: String,
}

impl ResultProcessor {
    /// Create a processor; `file_server_uri` prefixes the public file references
    pub fn new(
        db: Arc<Database>,
        tracker: CompletionTracker,
        file_server_uri: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tracker,
            file_server_uri: file_server_uri.into(),
        }
    }

    /// Settle the media record named by `result` and count it as processed
    pub async fn on_job_result(&self, result: &JobResult) -> Result<ResultOutcome> {
        let Some(media) = self.db.find_media(result.media_id).await? else {
            tracing::error!(media_id = %result.media_id, "result for unknown media, dropping");
            return Ok(ResultOutcome::UnknownMedia);
        };
        let package_id = PackageId(media.package_id);

        let settlement = match &result.outcome {
            JobOutcome::Downloaded { file_path } => MediaSettlement::Downloaded {
                file_path: file_path.to_string_lossy().into_owned(),
                new_url: public_file_url(&self.file_server_uri, result.media_id),
            },
            JobOutcome::Failed { error_msg } => MediaSettlement::Failed {
                error_message: error_msg.clone(),
            },
        };

        let settled = self.db.settle_media(result.media_id, &settlement).await?;
        if settled {
            tracing::info!(
                media_id = %result.media_id,
                package_id = %package_id,
                downloaded = matches!(settlement, MediaSettlement::Downloaded { .. }),
                "media settled"
            );
        } else {
            tracing::debug!(media_id = %result.media_id, "media already settled");
        }

        let progress = self.tracker.mark_processed(package_id, result.media_id).await?;

        Ok(ResultOutcome::Processed {
            package_id,
            settled,
            progress,
        })
    }
}

struct ResultHandler {
    processor: ResultProcessor,
    client: Arc<dyn QueueClient>,
}

#[async_trait]
impl MessageHandler<JobResult> for ResultHandler {
    async fn handle(&self, received: Received<JobResult>) {
        let Received { delivery, message } = received;

        let settle = match self.processor.on_job_result(&message).await {
            Ok(_) => self.client.ack(&delivery).await,
            Err(e) => match self.client.nack(&delivery, &e.to_string()).await {
                Ok(Redelivery::Exhausted) => {
                    tracing::error!(
                        media_id = %message.media_id,
                        message_id = delivery.id,
                        attempts = delivery.attempt,
                        error = %e,
                        "result exhausted its attempts; its package stays unfinished until the result is replayed"
                    );
                    Ok(())
                }
                Ok(Redelivery::Scheduled { delay }) => {
                    tracing::warn!(
                        media_id = %message.media_id,
                        attempt = delivery.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed to process result, leaving it for redelivery"
                    );
                    Ok(())
                }
                Err(nack_error) => Err(nack_error),
            },
        };

        if let Err(e) = settle {
            tracing::error!(
                media_id = %message.media_id,
                message_id = delivery.id,
                error = %e,
                "failed to settle result with the broker"
            );
        }
    }
}

/// Consumer pool on the result queue
pub struct ResultConsumer {
    pool: ConsumerPool,
}

impl ResultConsumer {
    /// Start consuming results with `workers.result_concurrency` slots
    pub fn start(client: Arc<dyn QueueClient>, processor: ResultProcessor, config: &Config) -> Self {
        let queue = TypedQueue::<JobResult>::new(
            client.clone(),
            config.queues.result_queue.clone(),
            config.result_retry.clone(),
        );
        let handler = Arc::new(ResultHandler { processor, client });

        let pool = ConsumerPool::start(
            queue,
            handler,
            PoolSettings {
                concurrency: config.workers.result_concurrency,
                lease: config.queues.lease_timeout,
                poll_interval: config.queues.poll_interval,
            },
        );

        Self { pool }
    }

    /// Stop taking results and wait for in-flight ones
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{AtomicCounterStore, MemoryCounterStore};
    use crate::db::NewMediaRecord;
    use crate::queue::MemoryQueue;
    use crate::types::{MediaKind, MediaStatus, PackageStatus};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Fixture {
        db: Arc<Database>,
        processor: ResultProcessor,
        package_id: PackageId,
        media: Vec<MediaId>,
        _file: NamedTempFile,
    }

    async fn fixture(items: usize) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(file.path()).await.unwrap());
        let records: Vec<_> = (0..items)
            .map(|i| NewMediaRecord {
                original_url: format!("https://x/{i}.png"),
                filename: format!("image-{i}"),
                media_type: MediaKind::Image,
            })
            .collect();
        let (package_id, media) = db.insert_package("p", "d", &records).await.unwrap();

        let counters: Arc<dyn AtomicCounterStore> = Arc::new(MemoryCounterStore::new());
        counters.init(package_id, &media).await.unwrap();
        let tracker = CompletionTracker::new(counters, db.clone());

        Fixture {
            processor: ResultProcessor::new(db.clone(), tracker, "http://files.local/"),
            db,
            package_id,
            media,
            _file: file,
        }
    }

    #[test]
    fn test_public_file_url() {
        assert_eq!(
            public_file_url("http://localhost:8000/", MediaId(7)),
            "http://localhost:8000/files/7"
        );
        assert_eq!(public_file_url("https://cdn", MediaId(1)), "https://cdn/files/1");
    }

    #[tokio::test]
    async fn test_success_and_failure_both_count_toward_completion() {
        let f = fixture(2).await;

        let first = f
            .processor
            .on_job_result(&JobResult::downloaded(f.media[0], "/data/image-0.png"))
            .await
            .unwrap();
        assert!(matches!(
            first,
            ResultOutcome::Processed { settled: true, progress, .. } if progress.remaining == 1
        ));

        let stored = f.db.find_media(f.media[0]).await.unwrap().unwrap();
        assert_eq!(MediaStatus::from_i32(stored.status), MediaStatus::Downloaded);
        assert_eq!(stored.filename.as_deref(), Some("/data/image-0.png"));
        assert_eq!(
            stored.new_url,
            Some(format!("http://files.local/files/{}", f.media[0]))
        );

        let second = f
            .processor
            .on_job_result(&JobResult::failed(f.media[1], "HTTP 404"))
            .await
            .unwrap();
        assert!(matches!(
            second,
            ResultOutcome::Processed { progress, .. } if progress.completed
        ));

        let failed = f.db.find_media(f.media[1]).await.unwrap().unwrap();
        assert_eq!(MediaStatus::from_i32(failed.status), MediaStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("HTTP 404"));

        let package = f.db.get_package(f.package_id).await.unwrap().unwrap();
        assert_eq!(PackageStatus::from_i32(package.status), PackageStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_result_is_a_no_op() {
        let f = fixture(2).await;
        let result = JobResult::downloaded(f.media[0], "/data/a.png");

        f.processor.on_job_result(&result).await.unwrap();
        let again = f.processor.on_job_result(&result).await.unwrap();
        match again {
            ResultOutcome::Processed {
                settled, progress, ..
            } => {
                assert!(!settled);
                assert!(!progress.counted);
                assert_eq!(progress.remaining, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        // A conflicting late result does not overwrite the terminal state
        f.processor
            .on_job_result(&JobResult::failed(f.media[0], "late"))
            .await
            .unwrap();
        let stored = f.db.find_media(f.media[0]).await.unwrap().unwrap();
        assert_eq!(MediaStatus::from_i32(stored.status), MediaStatus::Downloaded);
    }

    #[tokio::test]
    async fn test_unknown_media_is_dropped() {
        let f = fixture(1).await;
        let outcome = f
            .processor
            .on_job_result(&JobResult::failed(MediaId(4242), "x"))
            .await
            .unwrap();
        assert_eq!(outcome, ResultOutcome::UnknownMedia);
    }

    #[tokio::test]
    async fn test_pool_acks_processed_and_dropped_results() {
        let f = fixture(1).await;
        let mut config = Config::default();
        config.queues.poll_interval = Duration::from_millis(5);

        let client: Arc<dyn QueueClient> = Arc::new(MemoryQueue::new());
        let results = TypedQueue::<JobResult>::new(
            client.clone(),
            config.queues.result_queue.clone(),
            config.result_retry.clone(),
        );
        results
            .publish(&[
                JobResult::failed(MediaId(999), "unknown"),
                JobResult::downloaded(f.media[0], "/data/x.png"),
            ])
            .await
            .unwrap();

        let consumer = ResultConsumer::start(client.clone(), f.processor.clone(), &config);
        for _ in 0..200 {
            let status = f.db.get_package(f.package_id).await.unwrap().unwrap().status;
            if PackageStatus::from_i32(status) == PackageStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        consumer.shutdown().await;

        let package = f.db.get_package(f.package_id).await.unwrap().unwrap();
        assert_eq!(PackageStatus::from_i32(package.status), PackageStatus::Completed);

        let stats = results.stats().await.unwrap();
        assert_eq!(stats.waiting + stats.active + stats.failed, 0);
    }

    #[tokio::test]
    async fn test_result_that_keeps_failing_is_parked_not_dropped() {
        let f = fixture(1).await;
        let mut config = Config::default();
        config.queues.poll_interval = Duration::from_millis(5);
        config.result_retry = crate::config::RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        // No counter for the package, so every attempt fails in the tracker
        let tracker = CompletionTracker::new(Arc::new(MemoryCounterStore::new()), f.db.clone());
        let processor = ResultProcessor::new(f.db.clone(), tracker, "http://files.local");

        let queue = Arc::new(MemoryQueue::new());
        let client: Arc<dyn QueueClient> = queue.clone();
        let results = TypedQueue::<JobResult>::new(
            client.clone(),
            config.queues.result_queue.clone(),
            config.result_retry.clone(),
        );
        let handles = results
            .publish(&[JobResult::downloaded(f.media[0], "/data/x.png")])
            .await
            .unwrap();

        let consumer = ResultConsumer::start(client.clone(), processor, &config);
        for _ in 0..200 {
            if results.stats().await.unwrap().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        consumer.shutdown().await;

        let stats = results.stats().await.unwrap();
        assert_eq!(stats.failed, 1, "kept for replay");
        assert_eq!(stats.waiting + stats.active, 0);
        assert!(
            queue
                .last_error(&config.queues.result_queue, handles[0].id)
                .await
                .unwrap()
                .contains("pending counter")
        );
        let package = f.db.get_package(f.package_id).await.unwrap().unwrap();
        assert_eq!(PackageStatus::from_i32(package.status), PackageStatus::Pending);
    }
}
