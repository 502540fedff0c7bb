//! Download workers
//!
//! One [`DownloadWorker`] runs per media kind. Each leases jobs from its kind's
//! queue, downloads them under a bounded number of concurrent slots, and reports a
//! [`JobResult`] on the result queue.
//!
//! Per job: `received → extension resolved → downloading → succeeded | failed`.
//!
//! Retries belong to the broker, not the worker. Any failed download whose job
//! still has attempts left is nacked and nothing is reported; the broker redelivers
//! it after a backoff. This covers non-2xx responses and disk errors as well as
//! network failures. The failure is reported once the attempt budget is spent, so
//! each job normally yields exactly one result.

use crate::config::{Config, RetryConfig};
use crate::error::{Error, QueueError, Result};
use crate::queue::{
    ConsumerPool, Delivery, MessageHandler, PoolSettings, QueueClient, Received, TypedQueue,
};
use crate::retry::with_retry;
use crate::types::{DownloadJob, JobResult, MediaKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

mod fetch;

pub use fetch::{MediaFetcher, extension_from_url};

/// Download worker pool for one media kind
pub struct DownloadWorker {
    kind: MediaKind,
    pool: ConsumerPool,
}

impl DownloadWorker {
    /// Start consuming the kind's job queue
    pub fn start(client: Arc<dyn QueueClient>, kind: MediaKind, config: &Config) -> Result<Self> {
        let handler = Arc::new(DownloadHandler {
            kind,
            fetcher: MediaFetcher::new(&config.workers)?,
            results: TypedQueue::new(
                client.clone(),
                config.queues.result_queue.clone(),
                config.result_retry.clone(),
            ),
            report_retry: config.retry.clone(),
        });

        let jobs = TypedQueue::<DownloadJob>::new(
            client,
            config.queues.queue_for(kind),
            config.retry.clone(),
        );

        let pool = ConsumerPool::start(
            jobs,
            handler,
            PoolSettings {
                concurrency: config.workers.concurrency,
                lease: config.queues.lease_timeout,
                poll_interval: config.queues.poll_interval,
            },
        );

        tracing::info!(
            kind = %kind,
            concurrency = config.workers.concurrency,
            download_dir = %config.workers.download_dir.display(),
            "download worker started"
        );

        Ok(Self { kind, pool })
    }

    /// Media kind this worker downloads
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Refuse new jobs, then wait for in-flight downloads to finish.
    ///
    /// Downloads in progress are not interrupted.
    pub async fn shutdown(&self) {
        tracing::info!(kind = %self.kind, "download worker shutting down");
        self.pool.shutdown().await;
    }
}

/// What to do with the input job after an attempt
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Done; report this result and ack the job
    Report(JobResult),
    /// Failure with attempts left; nack for broker redelivery
    Retry(String),
    /// Final failure; report this result and retire the job
    ReportAndRetire(JobResult, String),
}

struct DownloadHandler {
    kind: MediaKind,
    fetcher: MediaFetcher,
    results: TypedQueue<JobResult>,
    report_retry: RetryConfig,
}

impl DownloadHandler {
    async fn run(&self, job: &DownloadJob, delivery: &Delivery) -> Result<PathBuf> {
        let extension = self.fetcher.resolve_extension(self.kind, &job.url).await;
        let target = self.fetcher.target_path(&job.filename, extension);

        tracing::debug!(
            media_id = %job.media_id,
            attempt = delivery.attempt,
            target = %target.display(),
            "downloading"
        );

        let part_tag = format!("{}-{}", delivery.id, delivery.attempt);
        let bytes = self.fetcher.download(&job.url, &target, &part_tag).await?;

        tracing::info!(
            media_id = %job.media_id,
            kind = %self.kind,
            bytes,
            path = %target.display(),
            "download complete"
        );
        Ok(target)
    }

    fn disposition(
        job: &DownloadJob,
        delivery: &Delivery,
        outcome: Result<PathBuf>,
    ) -> Disposition {
        match outcome {
            Ok(path) => Disposition::Report(JobResult::downloaded(job.media_id, path)),
            Err(e) if redeliverable(&e) && !delivery.is_final_attempt() => {
                Disposition::Retry(e.to_string())
            }
            Err(e) => {
                let message = e.to_string();
                Disposition::ReportAndRetire(JobResult::failed(job.media_id, &message), message)
            }
        }
    }

    async fn report(&self, result: &JobResult) -> std::result::Result<(), QueueError> {
        with_retry(&self.report_retry, || async {
            self.results.publish(std::slice::from_ref(result)).await
        })
        .await
        .map(|_| ())
    }

    async fn settle(&self, job: &DownloadJob, delivery: &Delivery, disposition: Disposition) {
        let client = self.results.client();

        let outcome: std::result::Result<(), Error> = async {
            match disposition {
                Disposition::Report(result) => {
                    self.report(&result).await?;
                    client.ack(delivery).await?;
                }
                Disposition::Retry(error) => {
                    let redelivery = client.nack(delivery, &error).await?;
                    tracing::warn!(
                        media_id = %job.media_id,
                        attempt = delivery.attempt,
                        max_attempts = delivery.policy.max_attempts,
                        error = %error,
                        ?redelivery,
                        "download failed, job will be redelivered"
                    );
                }
                Disposition::ReportAndRetire(result, error) => {
                    tracing::error!(
                        media_id = %job.media_id,
                        attempt = delivery.attempt,
                        error = %error,
                        "download failed, giving up on the job"
                    );
                    self.report(&result).await?;
                    if delivery.is_final_attempt() {
                        client.nack(delivery, &error).await?;
                    } else {
                        client.dead_letter(delivery, &error).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            // The lease runs out and the job comes back; the result path is idempotent
            tracing::error!(
                media_id = %job.media_id,
                message_id = delivery.id,
                error = %e,
                "failed to settle job with the broker"
            );
        }
    }
}

/// Whether another delivery of the same job could succeed.
///
/// Origins and disks change between attempts, so every fetch or write failure
/// qualifies. A job that cannot be encoded or is invalid never will.
fn redeliverable(error: &Error) -> bool {
    !matches!(error, Error::Validation(_) | Error::Serialization(_))
}

#[async_trait]
impl MessageHandler<DownloadJob> for DownloadHandler {
    async fn handle(&self, received: Received<DownloadJob>) {
        let Received { delivery, message } = received;
        let outcome = self.run(&message, &delivery).await;
        let disposition = Self::disposition(&message, &delivery, outcome);
        self.settle(&message, &delivery, disposition).await;
    }
}
