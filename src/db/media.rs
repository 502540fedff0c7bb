//! Media lookups and result settlement.

use crate::error::DatabaseError;
use crate::types::{MediaId, MediaStatus, PackageId};
use crate::{Error, Result};

use super::{Database, MediaRow, MediaSettlement};

impl Database {
    /// Get a media record by ID
    pub async fn find_media(&self, id: MediaId) -> Result<Option<MediaRow>> {
        let row = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT
                id, package_id, original_url, filename, media_type, status,
                new_url, error_message, created_at, updated_at
            FROM media
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get media: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List a package's media in submission order
    pub async fn list_media(
        &self,
        package_id: PackageId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MediaRow>> {
        let rows = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT
                id, package_id, original_url, filename, media_type, status,
                new_url, error_message, created_at, updated_at
            FROM media
            WHERE package_id = ?
            ORDER BY id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(package_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list media: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Number of media items in a package
    pub async fn count_media(&self, package_id: PackageId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media WHERE package_id = ?")
            .bind(package_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(count as u64)
    }

    /// Apply a job result to a pending media record
    ///
    /// Returns `false` when the record is missing or already terminal, so a
    /// redelivered result changes nothing.
    pub async fn settle_media(&self, id: MediaId, settlement: &MediaSettlement) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let query = match settlement {
            MediaSettlement::Downloaded { file_path, new_url } => sqlx::query(
                r#"
                UPDATE media
                SET status = ?, filename = ?, new_url = ?, error_message = NULL, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(MediaStatus::Downloaded.to_i32())
            .bind(file_path)
            .bind(new_url),
            MediaSettlement::Failed { error_message } => sqlx::query(
                r#"
                UPDATE media
                SET status = ?, error_message = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(MediaStatus::Failed.to_i32())
            .bind(error_message),
        };

        let result = query
            .bind(now)
            .bind(id)
            .bind(MediaStatus::Pending.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to settle media: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
