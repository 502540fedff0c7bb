//! Package creation and status transitions.
//!
//! Every status change is a single conditional `UPDATE`; the return value says
//! whether this call performed the transition.

use crate::error::DatabaseError;
use crate::types::{MediaId, MediaStatus, PackageId, PackageStatus};
use crate::{Error, Result};

use super::{Database, NewMediaRecord, PackageRow};

impl Database {
    /// Insert a package and its media in one transaction
    ///
    /// Both start out `pending`. Media IDs are returned in input order.
    pub async fn insert_package(
        &self,
        title: &str,
        description: &str,
        media: &[NewMediaRecord],
    ) -> Result<(PackageId, Vec<MediaId>)> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin package transaction: {}",
                e
            )))
        })?;

        let package_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO packages (title, description, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(PackageStatus::Pending.to_i32())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert package: {}",
                e
            )))
        })?;

        let mut media_ids = Vec::with_capacity(media.len());
        for item in media {
            let media_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO media (
                    package_id, original_url, filename, media_type, status,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(package_id)
            .bind(&item.original_url)
            .bind(&item.filename)
            .bind(item.media_type.to_i32())
            .bind(MediaStatus::Pending.to_i32())
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert media: {}",
                    e
                )))
            })?;
            media_ids.push(MediaId(media_id));
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit package: {}",
                e
            )))
        })?;

        Ok((PackageId(package_id), media_ids))
    }

    /// Get a package by ID
    pub async fn get_package(&self, id: PackageId) -> Result<Option<PackageRow>> {
        let row = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT id, title, description, status, created_at, updated_at
            FROM packages
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get package: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List packages, newest first
    pub async fn list_packages(&self, limit: i64, offset: i64) -> Result<Vec<PackageRow>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT id, title, description, status, created_at, updated_at
            FROM packages
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list packages: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Total number of packages
    pub async fn count_packages(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM packages")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(count as u64)
    }

    /// `pending → processing`
    pub async fn mark_package_processing(&self, id: PackageId) -> Result<bool> {
        self.transition_package(id, &[PackageStatus::Pending], PackageStatus::Processing)
            .await
    }

    /// `pending | processing → completed`
    ///
    /// Returns `false` if the package was already completed or has failed.
    pub async fn complete_package(&self, id: PackageId) -> Result<bool> {
        self.transition_package(
            id,
            &[PackageStatus::Pending, PackageStatus::Processing],
            PackageStatus::Completed,
        )
        .await
    }

    /// `pending | processing → failed`
    pub async fn fail_package(&self, id: PackageId) -> Result<bool> {
        self.transition_package(
            id,
            &[PackageStatus::Pending, PackageStatus::Processing],
            PackageStatus::Failed,
        )
        .await
    }

    async fn transition_package(
        &self,
        id: PackageId,
        from: &[PackageStatus],
        to: PackageStatus,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let mut query_builder = sqlx::QueryBuilder::new("UPDATE packages SET status = ");
        query_builder.push_bind(to.to_i32());
        query_builder.push(", updated_at = ");
        query_builder.push_bind(now);
        query_builder.push(" WHERE id = ");
        query_builder.push_bind(id);
        query_builder.push(" AND status IN (");
        let mut separated = query_builder.separated(", ");
        for status in from {
            separated.push_bind(status.to_i32());
        }
        separated.push_unseparated(")");

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update package status: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
