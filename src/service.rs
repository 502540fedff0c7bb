//! Package service
//!
//! Entry point for package submissions and the read side of packages and media.
//! [`PackageService::create_package`] persists the package, hands its items to the
//! [`JobPublisher`], and cleans up after a publish that stopped part-way.

use crate::completion::CompletionTracker;
use crate::db::{Database, MediaSettlement, NewMediaRecord};
use crate::error::{Error, PublishFailure, Result, ValidationError};
use crate::publisher::{JobPublisher, JobRequest};
use crate::types::{
    JobMetadata, Media, MediaId, MediaKind, NewPackage, Package, PackageId, Paginated,
};
use std::sync::Arc;

/// Page used when none is requested
pub const DEFAULT_PAGE: u32 = 1;
/// Page size used when none is requested
pub const DEFAULT_PAGE_SIZE: u32 = 10;
/// Largest page size served
pub const MAX_PAGE_SIZE: u32 = 100;

/// Normalize optional paging parameters to `(page, size)`
pub fn page_bounds(page: Option<u32>, size: Option<u32>) -> (u32, u32) {
    let page = page.unwrap_or(DEFAULT_PAGE).max(1);
    let size = size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, size)
}

fn limit_offset(page: u32, size: u32) -> (i64, i64) {
    (i64::from(size), i64::from(page - 1) * i64::from(size))
}

/// File name for an item submitted without one: `{kind}-{unix_millis}-{md5(url)}`
pub fn generate_unique_filename(kind: MediaKind, url: &str) -> String {
    format!(
        "{}-{}-{:x}",
        kind,
        chrono::Utc::now().timestamp_millis(),
        md5::compute(url.as_bytes())
    )
}

/// Creates packages and serves package/media queries
pub struct PackageService {
    db: Arc<Database>,
    publisher: JobPublisher,
    tracker: CompletionTracker,
}

impl PackageService {
    /// Create a service over the store, publisher and tracker
    pub fn new(db: Arc<Database>, publisher: JobPublisher, tracker: CompletionTracker) -> Self {
        Self {
            db,
            publisher,
            tracker,
        }
    }

    /// Check a submission before anything is persisted
    pub fn validate(package: &NewPackage) -> std::result::Result<(), ValidationError> {
        if package.title.trim().is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if package.description.trim().is_empty() {
            return Err(ValidationError::MissingField("description"));
        }
        if package.media.is_empty() {
            return Err(ValidationError::EmptySubmission);
        }
        for (index, item) in package.media.iter().enumerate() {
            if url::Url::parse(&item.url).is_err() {
                return Err(ValidationError::MalformedUrl {
                    index,
                    url: item.url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Persist a package and queue a download job for each of its items.
    ///
    /// On success the package is `processing` (or already `completed` if every
    /// result came back first). When publishing stops part-way the package is
    /// marked `failed`, the unqueued media are failed with the broker error and
    /// counted as processed, and the [`PublishFailure`] is returned.
    pub async fn create_package(&self, package: NewPackage) -> Result<Package> {
        Self::validate(&package)?;

        let records: Vec<NewMediaRecord> = package
            .media
            .iter()
            .map(|item| {
                let kind = item
                    .media_type
                    .unwrap_or_else(|| MediaKind::from_url(&item.url));
                let filename = match item.filename.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => generate_unique_filename(kind, &item.url),
                };
                NewMediaRecord {
                    original_url: item.url.clone(),
                    filename,
                    media_type: kind,
                }
            })
            .collect();

        let (package_id, media_ids) = self
            .db
            .insert_package(&package.title, &package.description, &records)
            .await?;

        tracing::info!(
            package_id = %package_id,
            items = media_ids.len(),
            "package created"
        );

        let metadata = JobMetadata {
            source: Some("api".to_string()),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            priority: None,
        };
        let requests: Vec<JobRequest> = records
            .iter()
            .zip(&media_ids)
            .map(|(record, &media_id)| JobRequest {
                media_id,
                url: record.original_url.clone(),
                filename: record.filename.clone(),
                media_type: Some(record.media_type),
                metadata: Some(metadata.clone()),
            })
            .collect();

        match self.publisher.submit_package_jobs(package_id, &requests).await {
            Ok(_) => {
                self.db.mark_package_processing(package_id).await?;
            }
            Err(Error::Publish(failure)) => {
                self.abandon_unqueued(package_id, &failure).await;
                return Err(Error::Publish(failure));
            }
            Err(e) => {
                tracing::error!(
                    package_id = %package_id,
                    error = %e,
                    "could not publish package, marking it failed"
                );
                self.fail_all(package_id, &media_ids, &e.to_string()).await;
                return Err(e);
            }
        }

        self.get_package(package_id).await
    }

    /// Clean up after a partial publish.
    ///
    /// The package is failed first so the tracker cannot complete it while the
    /// unqueued media are being counted.
    async fn abandon_unqueued(&self, package_id: PackageId, failure: &PublishFailure) {
        if let Err(e) = self.db.fail_package(package_id).await {
            tracing::error!(package_id = %package_id, error = %e, "failed to mark package failed");
        }

        let reason = failure.source.to_string();
        for &media_id in &failure.unqueued {
            let settlement = MediaSettlement::Failed {
                error_message: reason.clone(),
            };
            if let Err(e) = self.db.settle_media(media_id, &settlement).await {
                tracing::error!(media_id = %media_id, error = %e, "failed to mark media failed");
                continue;
            }
            if let Err(e) = self.tracker.mark_processed(package_id, media_id).await {
                tracing::error!(
                    package_id = %package_id,
                    media_id = %media_id,
                    error = %e,
                    "failed to count unqueued media"
                );
            }
        }
    }

    /// Nothing was queued; fail the package and every item and drop any counter
    async fn fail_all(&self, package_id: PackageId, media_ids: &[MediaId], reason: &str) {
        if let Err(e) = self.db.fail_package(package_id).await {
            tracing::error!(package_id = %package_id, error = %e, "failed to mark package failed");
        }
        if let Err(e) = self.tracker.release(package_id).await {
            tracing::error!(package_id = %package_id, error = %e, "failed to release pending counter");
        }
        for &media_id in media_ids {
            let settlement = MediaSettlement::Failed {
                error_message: reason.to_string(),
            };
            if let Err(e) = self.db.settle_media(media_id, &settlement).await {
                tracing::error!(media_id = %media_id, error = %e, "failed to mark media failed");
            }
        }
    }

    /// A package with the first page of its media
    pub async fn get_package(&self, id: PackageId) -> Result<Package> {
        let row = self
            .db
            .get_package(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("package {}", id)))?;

        let media = self
            .db
            .list_media(id, i64::from(MAX_PAGE_SIZE), 0)
            .await?
            .into_iter()
            .map(Media::from)
            .collect();

        Ok(row.into_package(media))
    }

    /// Packages, newest first, without their media
    pub async fn list_packages(&self, page: Option<u32>, size: Option<u32>) -> Result<Paginated<Package>> {
        let (page, size) = page_bounds(page, size);
        let (limit, offset) = limit_offset(page, size);

        let total = self.db.count_packages().await?;
        let items = self
            .db
            .list_packages(limit, offset)
            .await?
            .into_iter()
            .map(|row| row.into_package(Vec::new()))
            .collect();

        Ok(Paginated::new(items, total, page, size))
    }

    /// Media of one package in submission order
    pub async fn list_media(
        &self,
        package_id: PackageId,
        page: Option<u32>,
        size: Option<u32>,
    ) -> Result<Paginated<Media>> {
        if self.db.get_package(package_id).await?.is_none() {
            return Err(Error::NotFound(format!("package {}", package_id)));
        }

        let (page, size) = page_bounds(page, size);
        let (limit, offset) = limit_offset(page, size);

        let total = self.db.count_media(package_id).await?;
        let items = self
            .db
            .list_media(package_id, limit, offset)
            .await?
            .into_iter()
            .map(Media::from)
            .collect();

        Ok(Paginated::new(items, total, page, size))
    }

    /// A single media record
    pub async fn get_media(&self, id: MediaId) -> Result<Media> {
        self.db
            .find_media(id)
            .await?
            .map(Media::from)
            .ok_or_else(|| Error::NotFound(format!("media {}", id)))
    }
}
