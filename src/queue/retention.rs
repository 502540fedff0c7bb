//! Retention sweep for parked messages.

use super::QueueClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Purge messages parked longer than `retention` from each of `queues`.
///
/// A queue that cannot be swept is logged and skipped. Returns the total purged.
pub async fn purge_failed_messages(
    client: &dyn QueueClient,
    queues: &[String],
    retention: Duration,
) -> u64 {
    let mut purged = 0;
    for queue in queues {
        match client.purge_failed(queue, retention).await {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(queue = %queue, count, "purged parked messages");
                purged += count;
            }
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "failed to purge parked messages");
            }
        }
    }
    purged
}

/// Spawn a background task that runs [`purge_failed_messages`] every `interval`
/// until `cancel_token` is cancelled.
pub fn spawn_failed_sweep(
    client: Arc<dyn QueueClient>,
    queues: Vec<String>,
    retention: Duration,
    interval: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    purge_failed_messages(client.as_ref(), &queues, retention).await;
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    })
}
