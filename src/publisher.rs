//! Job publisher
//!
//! Turns the media items of one package into [`DownloadJob`] messages on the
//! per-kind queues. Publishing is best-effort across chunks: each chunk is accepted
//! or rejected by the broker as a whole, and a rejected chunk stops the submission
//! without rolling back the chunks before it. The caller learns exactly which media
//! made it onto a queue through [`PublishFailure`].

use crate::config::Config;
use crate::counter::AtomicCounterStore;
use crate::error::{Error, PublishFailure, Result, ValidationError};
use crate::queue::{QueueClient, TypedQueue};
use crate::types::{DownloadJob, JobHandle, JobMetadata, MediaId, MediaKind, PackageId};
use std::sync::Arc;

/// One item to publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    /// Persisted media record the job settles
    pub media_id: MediaId,
    /// Remote source URL
    pub url: String,
    /// Target file name without extension
    pub filename: String,
    /// Media kind; inferred from the URL when absent
    pub media_type: Option<MediaKind>,
    /// Carried through to the worker untouched
    pub metadata: Option<JobMetadata>,
}

/// Publishes download jobs and initializes the package's pending counter
pub struct JobPublisher {
    image_queue: TypedQueue<DownloadJob>,
    video_queue: TypedQueue<DownloadJob>,
    counters: Arc<dyn AtomicCounterStore>,
    chunk_size: usize,
}

impl JobPublisher {
    /// Create a publisher using the queue names, chunk size and retry policy from `config`
    pub fn new(
        client: Arc<dyn QueueClient>,
        counters: Arc<dyn AtomicCounterStore>,
        config: &Config,
    ) -> Self {
        let queue = |kind| {
            TypedQueue::new(
                client.clone(),
                config.queues.queue_for(kind),
                config.retry.clone(),
            )
        };

        Self {
            image_queue: queue(MediaKind::Image),
            video_queue: queue(MediaKind::Video),
            counters,
            chunk_size: config.publisher.chunk_size.max(1),
        }
    }

    fn queue(&self, kind: MediaKind) -> &TypedQueue<DownloadJob> {
        match kind {
            MediaKind::Image => &self.image_queue,
            MediaKind::Video => &self.video_queue,
        }
    }

    /// Validate every item and build its job, or reject the whole submission.
    pub fn validate(
        items: &[JobRequest],
    ) -> std::result::Result<Vec<(MediaKind, DownloadJob)>, ValidationError> {
        if items.is_empty() {
            return Err(ValidationError::EmptySubmission);
        }

        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                if item.media_id.get() <= 0 {
                    return Err(ValidationError::MissingMediaId { index });
                }
                if url::Url::parse(&item.url).is_err() {
                    return Err(ValidationError::MalformedUrl {
                        index,
                        url: item.url.clone(),
                    });
                }
                if item.filename.trim().is_empty() {
                    return Err(ValidationError::MissingFilename { index });
                }

                let kind = item
                    .media_type
                    .unwrap_or_else(|| MediaKind::from_url(&item.url));
                Ok((
                    kind,
                    DownloadJob {
                        media_id: item.media_id,
                        url: item.url.clone(),
                        filename: item.filename.clone(),
                        metadata: item.metadata.clone(),
                    },
                ))
            })
            .collect()
    }

    /// Publish the jobs of one package.
    ///
    /// Nothing touches the broker or the counter store unless every item is valid.
    /// The pending counter is initialized to the item count before the first
    /// enqueue, so results can never arrive ahead of it.
    ///
    /// Returns the handles of all queued jobs, or [`Error::Publish`] listing what was
    /// and was not queued when the broker failed part-way.
    pub async fn submit_package_jobs(
        &self,
        package_id: PackageId,
        items: &[JobRequest],
    ) -> Result<Vec<JobHandle>> {
        let jobs = Self::validate(items)?;

        let media_ids: Vec<MediaId> = jobs.iter().map(|(_, job)| job.media_id).collect();
        self.counters.init(package_id, &media_ids).await?;

        // Kind order is fixed; submission order is kept within each kind
        let batches: Vec<(MediaKind, Vec<DownloadJob>)> = MediaKind::ALL
            .iter()
            .map(|kind| {
                let batch = jobs
                    .iter()
                    .filter(|(job_kind, _)| job_kind == kind)
                    .map(|(_, job)| job.clone())
                    .collect::<Vec<_>>();
                (*kind, batch)
            })
            .filter(|(_, batch)| !batch.is_empty())
            .collect();

        let mut queued: Vec<JobHandle> = Vec::with_capacity(jobs.len());
        let mut published: usize = 0;

        for (kind, batch) in &batches {
            let queue = self.queue(*kind);
            for chunk in batch.chunks(self.chunk_size) {
                match queue.publish(chunk).await {
                    Ok(handles) => {
                        tracing::debug!(
                            package_id = %package_id,
                            queue = queue.name(),
                            count = handles.len(),
                            "published chunk"
                        );
                        published += chunk.len();
                        queued.extend(handles);
                    }
                    Err(source) => {
                        let unqueued = Self::unqueued_after(&batches, published);
                        tracing::error!(
                            package_id = %package_id,
                            queue = queue.name(),
                            queued = queued.len(),
                            unqueued = unqueued.len(),
                            error = %source,
                            "publishing stopped part-way"
                        );
                        return Err(Error::Publish(PublishFailure {
                            queued,
                            unqueued,
                            source,
                        }));
                    }
                }
            }
        }

        tracing::info!(
            package_id = %package_id,
            jobs = queued.len(),
            "published package jobs"
        );
        Ok(queued)
    }

    /// Media of every job past the first `published`, in publishing order
    fn unqueued_after(batches: &[(MediaKind, Vec<DownloadJob>)], published: usize) -> Vec<MediaId> {
        batches
            .iter()
            .flat_map(|(_, batch)| batch.iter())
            .skip(published)
            .map(|job| job.media_id)
            .collect()
    }
}
