//! Retry classification and exponential backoff
//!
//! Two users share the same backoff math:
//! - the broker computes the redelivery delay of a nacked job from the
//!   [`RetryConfig`] attached when the job was published ([`backoff_delay`]);
//! - workers retry short in-process operations such as handing a result to the
//!   broker ([`with_retry`]).
//!
//! [`IsRetryable`] decides whether an in-process operation is worth calling again.
//! Download jobs do not consult it: the broker redelivers every failed attempt
//! until the job's attempt budget is spent.
//!
//! # Example
//!
//! ```no_run
//! use media_dl::retry::{IsRetryable, with_retry};
//! use media_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, QueueError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, refused connections, overloaded origins) return `true`.
/// Permanent failures (missing resources, bad input, corrupt payloads) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| is_retryable_status(s.as_u16()))
            }
            Error::HttpStatus { status, .. } => is_retryable_status(*status),
            Error::Io(e) => is_transient_io(e.kind()),
            Error::Queue(e) => e.is_retryable(),
            Error::Publish(failure) => failure.source.is_retryable(),
            // The response body was cut short; the next attempt may get all of it
            Error::Download(_) => true,
            // Store errors are fatal for the attempt; the message is redelivered
            Error::Database(_) | Error::Sqlx(_) => true,
            Error::Config { .. }
            | Error::Validation(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::ShuttingDown
            | Error::ApiServerError(_)
            | Error::Other(_) => false,
        }
    }
}

impl IsRetryable for QueueError {
    fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// 5xx and 429 are worth another attempt; other statuses will not change
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Delay before delivery number `attempt + 1`, given that `attempt` deliveries failed.
///
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`, with
/// optional jitter. `attempt` is 1-based; 0 is treated as 1.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped = if secs.is_finite() {
        Duration::from_secs_f64(secs.max(0.0)).min(config.max_delay)
    } else {
        config.max_delay
    };

    if config.jitter {
        add_jitter(capped).min(config.max_delay)
    } else {
        capped
    }
}

/// Run an async operation until it succeeds, fails permanently, or uses
/// `config.max_attempts` attempts (the first call included).
///
/// Returns the successful result or the last error.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(error = %e, attempts = attempt, "retry attempts exhausted");
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Jitter is uniformly distributed between 0% and 100% of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_starts_at_initial_delay_and_doubles() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_backoff_stays_within_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let delay = backoff_delay(&config, 2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[tokio::test]
    async fn test_success_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_counts_first_call() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Transient)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();

        let result = with_retry(&fast_config(5), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Permanent)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_http_status_classification() {
        let status = |status| Error::HttpStatus {
            url: "https://x/a.jpg".into(),
            status,
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
    }

    #[test]
    fn test_io_classification() {
        let io = |kind| Error::Io(std::io::Error::new(kind, "io"));
        assert!(io(std::io::ErrorKind::ConnectionReset).is_retryable());
        assert!(io(std::io::ErrorKind::TimedOut).is_retryable());
        assert!(!io(std::io::ErrorKind::PermissionDenied).is_retryable());
        assert!(!io(std::io::ErrorKind::NotFound).is_retryable());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!Error::Validation(ValidationError::EmptySubmission).is_retryable());
        assert!(!Error::NotFound("media 1".into()).is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(Error::Queue(QueueError::Unavailable("down".into())).is_retryable());
        assert!(
            !Error::Queue(QueueError::InvalidMessage {
                queue: "q".into(),
                reason: "bad json".into()
            })
            .is_retryable()
        );
    }
}
