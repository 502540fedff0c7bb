//! Per-package pending counters
//!
//! A counter starts at the number of media items in a package and drops by one for
//! each item whose result has been processed. De-duplication lives inside the store:
//! the counter remembers which media IDs are still pending, and a decrement for an
//! item that was already counted is reported as not applied instead of lowering the
//! count a second time. Redelivered results therefore cannot push a package to zero
//! early.

use crate::error::{Error, Result};
use crate::types::{MediaId, PackageId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Outcome of one decrement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decrement {
    /// Counter value after the call
    pub remaining: u64,
    /// False when the media item had already been counted
    pub applied: bool,
}

/// Shared store of pending counters
///
/// `decrement` must be a single atomic step of the store: remove the media ID from
/// the pending set, lower the counter if it was present, and return the new value.
/// Callers never read and then write.
#[async_trait]
pub trait AtomicCounterStore: Send + Sync {
    /// Start tracking `media` as the pending items of `package`
    async fn init(&self, package: PackageId, media: &[MediaId]) -> Result<()>;

    /// Count one media item as processed
    ///
    /// Fails with [`Error::NotFound`] when no counter exists for the package.
    async fn decrement(&self, package: PackageId, media: MediaId) -> Result<Decrement>;

    /// Current value, or `None` when the package has no counter
    async fn remaining(&self, package: PackageId) -> Result<Option<u64>>;

    /// Forget the package's counter and pending set. A missing counter is not an error.
    async fn remove(&self, package: PackageId) -> Result<()>;
}

/// Counters held in process memory
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    pending: Mutex<HashMap<PackageId, HashSet<MediaId>>>,
}

impl MemoryCounterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomicCounterStore for MemoryCounterStore {
    async fn init(&self, package: PackageId, media: &[MediaId]) -> Result<()> {
        let mut pending = self.pending.lock().await;
        pending.insert(package, media.iter().copied().collect());
        Ok(())
    }

    async fn decrement(&self, package: PackageId, media: MediaId) -> Result<Decrement> {
        let mut pending = self.pending.lock().await;
        let set = pending
            .get_mut(&package)
            .ok_or_else(|| Error::NotFound(format!("pending counter for package {}", package)))?;

        let applied = set.remove(&media);
        Ok(Decrement {
            remaining: set.len() as u64,
            applied,
        })
    }

    async fn remaining(&self, package: PackageId) -> Result<Option<u64>> {
        let pending = self.pending.lock().await;
        Ok(pending.get(&package).map(|set| set.len() as u64))
    }

    async fn remove(&self, package: PackageId) -> Result<()> {
        self.pending.lock().await.remove(&package);
        Ok(())
    }
}
