//! Durable queue backed by SQLite.
//!
//! Several processes may share one database file: a lease is taken with a single
//! `UPDATE .. RETURNING`, so two consumers never receive the same delivery.

use crate::config::RetryConfig;
use crate::error::QueueError;
use crate::queue::{Delivery, QueueClient, Redelivery};
use crate::retry::backoff_delay;
use crate::types::{JobHandle, QueueStats};
use async_trait::async_trait;
use sqlx::FromRow;
use std::time::Duration;

use super::Database;

/// Message state codes stored in `queue_messages.state`
mod state {
    pub const WAITING: i32 = 0;
    pub const ACTIVE: i32 = 1;
    pub const FAILED: i32 = 2;
}

#[derive(Debug, FromRow)]
struct LeasedRow {
    id: i64,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    initial_delay_ms: i64,
    max_delay_ms: i64,
    backoff_multiplier: f64,
    jitter: bool,
}

impl LeasedRow {
    fn into_delivery(self, queue: &str) -> Delivery {
        Delivery {
            id: self.id,
            queue: queue.to_string(),
            payload: self.payload,
            attempt: self.attempts.max(0) as u32,
            policy: RetryConfig {
                max_attempts: self.max_attempts.max(0) as u32,
                initial_delay: Duration::from_millis(self.initial_delay_ms.max(0) as u64),
                max_delay: Duration::from_millis(self.max_delay_ms.max(0) as u64),
                backoff_multiplier: self.backoff_multiplier,
                jitter: self.jitter,
            },
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn unavailable(action: &str, e: sqlx::Error) -> QueueError {
    QueueError::Unavailable(format!("failed to {}: {}", action, e))
}

fn unknown(delivery: &Delivery) -> QueueError {
    QueueError::UnknownDelivery {
        queue: delivery.queue.clone(),
        id: delivery.id,
    }
}

#[async_trait]
impl QueueClient for Database {
    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<String>,
        policy: &RetryConfig,
    ) -> Result<Vec<JobHandle>, QueueError> {
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("begin enqueue", e))?;

        let mut handles = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO queue_messages (
                    queue, payload, state, attempts, max_attempts,
                    initial_delay_ms, max_delay_ms, backoff_multiplier, jitter,
                    visible_at, created_at
                ) VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(queue)
            .bind(payload)
            .bind(state::WAITING)
            .bind(i64::from(policy.max_attempts))
            .bind(policy.initial_delay.as_millis() as i64)
            .bind(policy.max_delay.as_millis() as i64)
            .bind(policy.backoff_multiplier)
            .bind(policy.jitter)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| unavailable("enqueue message", e))?;

            handles.push(JobHandle {
                queue: queue.to_string(),
                id,
            });
        }

        tx.commit()
            .await
            .map_err(|e| unavailable("commit enqueue", e))?;

        tracing::debug!(queue, count = handles.len(), "enqueued batch");
        Ok(handles)
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = now_millis();
        let lease_until = now + lease.as_millis() as i64;

        // Waiting messages whose backoff elapsed and active ones whose lease expired
        let row = sqlx::query_as::<_, LeasedRow>(
            r#"
            UPDATE queue_messages
            SET state = ?, attempts = attempts + 1, visible_at = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND state IN (?, ?) AND visible_at <= ?
                ORDER BY visible_at ASC, id ASC
                LIMIT 1
            )
            RETURNING
                id, payload, attempts, max_attempts,
                initial_delay_ms, max_delay_ms, backoff_multiplier, jitter
            "#,
        )
        .bind(state::ACTIVE)
        .bind(lease_until)
        .bind(queue)
        .bind(state::WAITING)
        .bind(state::ACTIVE)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("reserve message", e))?;

        Ok(row.map(|row| row.into_delivery(queue)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE id = ? AND state = ? AND attempts = ?")
                .bind(delivery.id)
                .bind(state::ACTIVE)
                .bind(i64::from(delivery.attempt))
                .execute(&self.pool)
                .await
                .map_err(|e| unavailable("ack message", e))?;

        if result.rows_affected() == 0 {
            return Err(unknown(delivery));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<Redelivery, QueueError> {
        let (next_state, visible_at, redelivery) = if delivery.is_final_attempt() {
            (state::FAILED, now_millis(), Redelivery::Exhausted)
        } else {
            let delay = backoff_delay(&delivery.policy, delivery.attempt);
            (
                state::WAITING,
                now_millis() + delay.as_millis() as i64,
                Redelivery::Scheduled { delay },
            )
        };

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = ?, visible_at = ?, last_error = ?
            WHERE id = ? AND state = ? AND attempts = ?
            "#,
        )
        .bind(next_state)
        .bind(visible_at)
        .bind(error)
        .bind(delivery.id)
        .bind(state::ACTIVE)
        .bind(i64::from(delivery.attempt))
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("nack message", e))?;

        if result.rows_affected() == 0 {
            return Err(unknown(delivery));
        }
        Ok(redelivery)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = ?, last_error = ?
            WHERE id = ? AND state = ? AND attempts = ?
            "#,
        )
        .bind(state::FAILED)
        .bind(error)
        .bind(delivery.id)
        .bind(state::ACTIVE)
        .bind(i64::from(delivery.attempt))
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("dead-letter message", e))?;

        if result.rows_affected() == 0 {
            return Err(unknown(delivery));
        }
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM queue_messages WHERE queue = ? GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("read queue stats", e))?;

        let mut stats = QueueStats::default();
        for (code, count) in rows {
            let count = count.max(0) as u64;
            match code {
                state::WAITING => stats.waiting = count,
                state::ACTIVE => stats.active = count,
                _ => stats.failed += count,
            }
        }
        Ok(stats)
    }

    async fn purge_failed(&self, queue: &str, older_than: Duration) -> Result<u64, QueueError> {
        // Parked messages keep the time they were parked in `visible_at`
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as i64);
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE queue = ? AND state = ? AND visible_at <= ?",
        )
        .bind(queue)
        .bind(state::FAILED)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("purge failed messages", e))?;

        Ok(result.rows_affected())
    }
}

impl Database {
    /// Last error recorded for a queue message, if the message still exists
    pub async fn queue_message_error(&self, id: i64) -> crate::Result<Option<String>> {
        let error: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_error FROM queue_messages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(crate::Error::Sqlx)?;

        Ok(error.flatten())
    }
}
