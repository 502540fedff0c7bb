//! Pending counters backed by SQLite.
//!
//! `package_counters.remaining` is the counter; `pending_media` holds the media IDs
//! not yet counted. A decrement deletes the media row and lowers the counter in the
//! same transaction, and only lowers it when the delete hit a row.

use crate::counter::{AtomicCounterStore, Decrement};
use crate::error::DatabaseError;
use crate::types::{MediaId, PackageId};
use crate::{Error, Result};
use async_trait::async_trait;

use super::Database;

#[async_trait]
impl AtomicCounterStore for Database {
    async fn init(&self, package: PackageId, media: &[MediaId]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin counter transaction: {}",
                e
            )))
        })?;

        sqlx::query("DELETE FROM pending_media WHERE package_id = ?")
            .bind(package)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?;

        for media_id in media {
            sqlx::query("INSERT OR IGNORE INTO pending_media (package_id, media_id) VALUES (?, ?)")
                .bind(package)
                .bind(*media_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Sqlx)?;
        }

        sqlx::query(
            r#"
            INSERT INTO package_counters (package_id, remaining)
            VALUES (?, (SELECT COUNT(*) FROM pending_media WHERE package_id = ?))
            ON CONFLICT(package_id) DO UPDATE SET remaining = excluded.remaining
            "#,
        )
        .bind(package)
        .bind(package)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to initialize pending counter: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit pending counter: {}",
                e
            )))
        })?;

        Ok(())
    }

    async fn decrement(&self, package: PackageId, media: MediaId) -> Result<Decrement> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin counter transaction: {}",
                e
            )))
        })?;

        // The delete takes the write lock first, so concurrent decrements serialize here
        let removed = sqlx::query("DELETE FROM pending_media WHERE package_id = ? AND media_id = ?")
            .bind(package)
            .bind(media)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?
            .rows_affected()
            > 0;

        let remaining: Option<i64> = if removed {
            sqlx::query_scalar(
                r#"
                UPDATE package_counters
                SET remaining = remaining - 1
                WHERE package_id = ? AND remaining > 0
                RETURNING remaining
                "#,
            )
            .bind(package)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to decrement pending counter: {}",
                    e
                )))
            })?
        } else {
            sqlx::query_scalar("SELECT remaining FROM package_counters WHERE package_id = ?")
                .bind(package)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Sqlx)?
        };

        let Some(remaining) = remaining else {
            // Nothing was written; dropping the transaction rolls back the delete
            return Err(Error::NotFound(format!(
                "pending counter for package {}",
                package
            )));
        };

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit pending counter: {}",
                e
            )))
        })?;

        Ok(Decrement {
            remaining: remaining.max(0) as u64,
            applied: removed,
        })
    }

    async fn remaining(&self, package: PackageId) -> Result<Option<u64>> {
        let remaining: Option<i64> =
            sqlx::query_scalar("SELECT remaining FROM package_counters WHERE package_id = ?")
                .bind(package)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Sqlx)?;

        Ok(remaining.map(|value| value.max(0) as u64))
    }

    async fn remove(&self, package: PackageId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin counter transaction: {}",
                e
            )))
        })?;

        sqlx::query("DELETE FROM pending_media WHERE package_id = ?")
            .bind(package)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?;
        sqlx::query("DELETE FROM package_counters WHERE package_id = ?")
            .bind(package)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to remove pending counter: {}",
                e
            )))
        })?;

        Ok(())
    }
}
