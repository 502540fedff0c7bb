//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Database(DatabaseError::ConnectionFailed(format!(
                        "Failed to create database directory: {}",
                        e
                    )))
                })?;
            }
        }

        // Foreign keys on, WAL so API readers don't block queue writers
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        exec(
            &mut conn,
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
            "create schema_version table",
        )
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if current_version < 2 {
            Self::migrate_v2(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: packages, media and pending counters
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        begin(conn).await?;

        let result = async {
            Self::create_packages_schema(conn).await?;
            Self::create_counters_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        finish(conn, result, 1).await?;
        tracing::info!("Database migration v1 complete");
        Ok(())
    }

    /// Migration v2: durable queue
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v2");

        begin(conn).await?;

        let result = async {
            Self::create_queue_schema(conn).await?;
            Self::record_migration(conn, 2).await?;
            Ok::<(), Error>(())
        }
        .await;

        finish(conn, result, 2).await?;
        tracing::info!("Database migration v2 complete");
        Ok(())
    }

    async fn create_packages_schema(conn: &mut SqliteConnection) -> Result<()> {
        exec(
            conn,
            r#"
            CREATE TABLE packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "create packages table",
        )
        .await?;

        exec(
            conn,
            r#"
            CREATE TABLE media (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
                original_url TEXT NOT NULL,
                filename TEXT,
                media_type INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                new_url TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "create media table",
        )
        .await?;

        exec(
            conn,
            "CREATE INDEX idx_media_package ON media(package_id, id)",
            "create media index",
        )
        .await?;

        Ok(())
    }

    async fn create_counters_schema(conn: &mut SqliteConnection) -> Result<()> {
        exec(
            conn,
            r#"
            CREATE TABLE package_counters (
                package_id INTEGER PRIMARY KEY,
                remaining INTEGER NOT NULL CHECK (remaining >= 0)
            )
            "#,
            "create package_counters table",
        )
        .await?;

        exec(
            conn,
            r#"
            CREATE TABLE pending_media (
                package_id INTEGER NOT NULL,
                media_id INTEGER NOT NULL,
                PRIMARY KEY (package_id, media_id)
            )
            "#,
            "create pending_media table",
        )
        .await?;

        Ok(())
    }

    async fn create_queue_schema(conn: &mut SqliteConnection) -> Result<()> {
        // state: 0 = waiting, 1 = active (leased), 2 = failed
        // visible_at is in unix milliseconds
        exec(
            conn,
            r#"
            CREATE TABLE queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                initial_delay_ms INTEGER NOT NULL,
                max_delay_ms INTEGER NOT NULL,
                backoff_multiplier REAL NOT NULL,
                jitter INTEGER NOT NULL DEFAULT 0,
                visible_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "create queue_messages table",
        )
        .await?;

        exec(
            conn,
            "CREATE INDEX idx_queue_messages_visible ON queue_messages(queue, state, visible_at, id)",
            "create queue_messages index",
        )
        .await?;

        Ok(())
    }

    /// Record a migration version
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn exec(conn: &mut SqliteConnection, sql: &str, what: &str) -> Result<()> {
    sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
        Error::Database(DatabaseError::MigrationFailed(format!(
            "Failed to {}: {}",
            what, e
        )))
    })?;
    Ok(())
}

async fn begin(conn: &mut SqliteConnection) -> Result<()> {
    exec(conn, "BEGIN", "begin transaction").await
}

/// Commit on success, roll back and return the error otherwise
async fn finish(conn: &mut SqliteConnection, result: Result<()>, version: i32) -> Result<()> {
    match result {
        Ok(()) => exec(conn, "COMMIT", &format!("commit migration v{}", version)).await,
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}
