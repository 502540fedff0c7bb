//! Completion tracker
//!
//! Counts processed media against the package's pending counter and moves the
//! package to `completed` when the counter reaches zero.
//!
//! The decrement is one atomic step of the counter store and the status change is
//! a conditional single-row update, so concurrent consumers can race on the same
//! package without a read-then-write anywhere. The status update runs whenever the
//! counter is zero, not only on the decrement that got it there: if a consumer
//! dies between the two, the redelivered result finishes the job.
//!
//! Once the counter is zero and the package is terminal, the counter is released.
//! A result for a package whose counter is gone is a duplicate and counts as a
//! no-op, as long as the package itself is terminal.

use crate::counter::AtomicCounterStore;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{MediaId, PackageId, PackageStatus};
use std::sync::Arc;

/// What one `mark_processed` call did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Pending media left in the package
    pub remaining: u64,
    /// False when this media item had been counted before
    pub counted: bool,
    /// True only for the call that moved the package to `completed`
    pub completed: bool,
}

/// Decrements pending counters and completes packages
#[derive(Clone)]
pub struct CompletionTracker {
    counters: Arc<dyn AtomicCounterStore>,
    db: Arc<Database>,
}

impl CompletionTracker {
    /// Create a tracker over a counter store and the package store
    pub fn new(counters: Arc<dyn AtomicCounterStore>, db: Arc<Database>) -> Self {
        Self { counters, db }
    }

    /// Count `media_id` as processed for `package_id`.
    ///
    /// Safe to call more than once for the same media item; only the first call
    /// lowers the counter.
    pub async fn mark_processed(&self, package_id: PackageId, media_id: MediaId) -> Result<Progress> {
        let decrement = match self.counters.decrement(package_id, media_id).await {
            Ok(decrement) => decrement,
            Err(Error::NotFound(what)) => {
                if !self.is_terminal(package_id).await? {
                    return Err(Error::NotFound(what));
                }
                tracing::debug!(
                    package_id = %package_id,
                    media_id = %media_id,
                    "package already finished and its counter released"
                );
                return Ok(Progress {
                    remaining: 0,
                    counted: false,
                    completed: false,
                });
            }
            Err(e) => return Err(e),
        };

        if !decrement.applied {
            tracing::debug!(
                package_id = %package_id,
                media_id = %media_id,
                remaining = decrement.remaining,
                "media already counted"
            );
        }

        let mut completed = false;
        if decrement.remaining == 0 {
            completed = self.db.complete_package(package_id).await?;
            if completed || self.is_terminal(package_id).await? {
                self.release(package_id).await?;
            }
        }

        if completed {
            tracing::info!(package_id = %package_id, "package completed");
        }

        Ok(Progress {
            remaining: decrement.remaining,
            counted: decrement.applied,
            completed,
        })
    }

    /// Drop the package's pending counter
    pub async fn release(&self, package_id: PackageId) -> Result<()> {
        self.counters.remove(package_id).await?;
        tracing::debug!(package_id = %package_id, "pending counter released");
        Ok(())
    }

    async fn is_terminal(&self, package_id: PackageId) -> Result<bool> {
        let status = self
            .db
            .get_package(package_id)
            .await?
            .map(|row| PackageStatus::from_i32(row.status));
        Ok(matches!(
            status,
            Some(PackageStatus::Completed | PackageStatus::Failed)
        ))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use crate::db::NewMediaRecord;
    use crate::types::MediaKind;
    use tempfile::NamedTempFile;

    async fn setup(items: usize) -> (CompletionTracker, Arc<Database>, PackageId, Vec<MediaId>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(file.path()).await.unwrap());
        let records: Vec<NewMediaRecord> = (0..items)
            .map(|i| NewMediaRecord {
                original_url: format!("https://x/{i}.jpg"),
                filename: format!("image-{i}"),
                media_type: MediaKind::Image,
            })
            .collect();
        let (package_id, media_ids) = db.insert_package("t", "d", &records).await.unwrap();

        let counters: Arc<dyn AtomicCounterStore> = Arc::new(MemoryCounterStore::new());
        counters.init(package_id, &media_ids).await.unwrap();

        (
            CompletionTracker::new(counters, db.clone()),
            db,
            package_id,
            media_ids,
            file,
        )
    }

    async fn status(db: &Database, id: PackageId) -> PackageStatus {
        PackageStatus::from_i32(db.get_package(id).await.unwrap().unwrap().status)
    }

    #[tokio::test]
    async fn test_completes_on_last_item_only() {
        let (tracker, db, package, media, _file) = setup(3).await;

        let first = tracker.mark_processed(package, media[0]).await.unwrap();
        assert_eq!(
            first,
            Progress {
                remaining: 2,
                counted: true,
                completed: false
            }
        );
        tracker.mark_processed(package, media[2]).await.unwrap();
        assert_eq!(status(&db, package).await, PackageStatus::Pending);

        let last = tracker.mark_processed(package, media[1]).await.unwrap();
        assert!(last.completed);
        assert_eq!(last.remaining, 0);
        assert_eq!(status(&db, package).await, PackageStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_double_count_or_recomplete() {
        let (tracker, _db, package, media, _file) = setup(2).await;

        tracker.mark_processed(package, media[0]).await.unwrap();
        let again = tracker.mark_processed(package, media[0]).await.unwrap();
        assert_eq!(again.remaining, 1);
        assert!(!again.counted);

        assert!(tracker.mark_processed(package, media[1]).await.unwrap().completed);
        let late = tracker.mark_processed(package, media[1]).await.unwrap();
        assert!(!late.completed, "completion fires once");
        assert!(!late.counted);
    }

    #[tokio::test]
    async fn test_concurrent_results_complete_exactly_once() {
        let (tracker, db, package, media, _file) = setup(20).await;

        let handles: Vec<_> = media
            .iter()
            .chain(media.iter())
            .map(|&m| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.mark_processed(package, m).await.unwrap() })
            })
            .collect();

        let mut completions = 0;
        for handle in handles {
            if handle.await.unwrap().completed {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(status(&db, package).await, PackageStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_package_is_not_completed() {
        let (tracker, db, package, media, _file) = setup(1).await;
        db.fail_package(package).await.unwrap();

        let progress = tracker.mark_processed(package, media[0]).await.unwrap();
        assert_eq!(progress.remaining, 0);
        assert!(!progress.completed);
        assert_eq!(status(&db, package).await, PackageStatus::Failed);
    }

    #[tokio::test]
    async fn test_counter_released_once_package_is_terminal() {
        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(file.path()).await.unwrap());
        let record = |i: usize| NewMediaRecord {
            original_url: format!("https://x/{i}.jpg"),
            filename: format!("image-{i}"),
            media_type: MediaKind::Image,
        };
        let (done, done_media) = db.insert_package("a", "d", &[record(0), record(1)]).await.unwrap();
        let (failed, failed_media) = db.insert_package("b", "d", &[record(2)]).await.unwrap();

        let counters: Arc<dyn AtomicCounterStore> = db.clone();
        counters.init(done, &done_media).await.unwrap();
        counters.init(failed, &failed_media).await.unwrap();
        let tracker = CompletionTracker::new(counters.clone(), db.clone());

        tracker.mark_processed(done, done_media[0]).await.unwrap();
        assert_eq!(counters.remaining(done).await.unwrap(), Some(1));
        assert!(tracker.mark_processed(done, done_media[1]).await.unwrap().completed);
        assert_eq!(counters.remaining(done).await.unwrap(), None);

        db.fail_package(failed).await.unwrap();
        tracker.mark_processed(failed, failed_media[0]).await.unwrap();
        assert_eq!(counters.remaining(failed).await.unwrap(), None);

        // Late duplicates after the release are no-ops
        let late = tracker.mark_processed(done, done_media[0]).await.unwrap();
        assert_eq!(
            late,
            Progress {
                remaining: 0,
                counted: false,
                completed: false
            }
        );
        assert_eq!(status(&db, done).await, PackageStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_counter_of_unfinished_package_is_an_error() {
        let (_tracker, db, package, media, _file) = setup(1).await;
        let tracker = CompletionTracker::new(Arc::new(MemoryCounterStore::new()), db);

        let err = tracker.mark_processed(package, media[0]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_package_is_an_error() {
        let (tracker, _db, _package, media, _file) = setup(1).await;
        let err = tracker.mark_processed(PackageId(999), media[0]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
