//! Database layer for media-dl
//!
//! Handles SQLite persistence for packages, media, pending counters and the
//! durable job queues.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`packages`] - Package creation and status transitions
//! - [`media`] - Media lookups and result settlement
//! - [`counters`] - [`AtomicCounterStore`](crate::counter::AtomicCounterStore) implementation
//! - [`queue`] - [`QueueClient`](crate::queue::QueueClient) implementation

use crate::types::{Media, MediaId, MediaKind, MediaStatus, Package, PackageId, PackageStatus};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod counters;
mod media;
mod migrations;
mod packages;
mod queue;

/// Media item to be inserted alongside its package
#[derive(Debug, Clone)]
pub struct NewMediaRecord {
    /// Source URL
    pub original_url: String,
    /// Target file name, without extension
    pub filename: String,
    /// Media kind
    pub media_type: MediaKind,
}

/// Package record from database
#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    /// Unique database ID
    pub id: i64,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Status code (see [`PackageStatus::from_i32`])
    pub status: i32,
    /// Unix timestamp when the package was created
    pub created_at: i64,
    /// Unix timestamp of the last status change
    pub updated_at: i64,
}

impl PackageRow {
    /// Convert to the client-facing type with the given media page attached
    pub fn into_package(self, media: Vec<Media>) -> Package {
        Package {
            id: PackageId(self.id),
            title: self.title,
            description: self.description,
            status: PackageStatus::from_i32(self.status),
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
            media,
        }
    }
}

/// Media record from database
#[derive(Debug, Clone, FromRow)]
pub struct MediaRow {
    /// Unique database ID
    pub id: i64,
    /// Owning package
    pub package_id: i64,
    /// Source URL
    pub original_url: String,
    /// Requested file name, replaced by the stored path on success
    pub filename: Option<String>,
    /// Kind code (see [`MediaKind::from_i32`])
    pub media_type: i32,
    /// Status code (see [`MediaStatus::from_i32`])
    pub status: i32,
    /// Public reference, set on success
    pub new_url: Option<String>,
    /// Failure reason, set on failure
    pub error_message: Option<String>,
    /// Unix timestamp when the record was created
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
}

impl From<MediaRow> for Media {
    fn from(row: MediaRow) -> Self {
        Media {
            id: MediaId(row.id),
            package_id: PackageId(row.package_id),
            original_url: row.original_url,
            filename: row.filename,
            media_type: MediaKind::from_i32(row.media_type),
            status: MediaStatus::from_i32(row.status),
            new_url: row.new_url,
            error_message: row.error_message,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

/// How a result settles a media record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSettlement {
    /// Stored locally
    Downloaded {
        /// Stored file path
        file_path: String,
        /// Public reference handed to clients
        new_url: String,
    },
    /// Gave up
    Failed {
        /// Failure reason
        error_message: String,
    },
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

/// Database handle for media-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
