//! # media-dl
//!
//! Asynchronous media-download job pipeline.
//!
//! A client submits a *package* of remote media URLs. Each item becomes a
//! [`DownloadJob`](types::DownloadJob) on a durable per-kind queue; download workers
//! stream the files to local storage and report a [`JobResult`](types::JobResult);
//! the result consumer settles the media records and a per-package atomic counter
//! moves the package to `completed` once every item is processed.
//!
//! ## Components
//!
//! - [`publisher`] - validates items, initializes the pending counter, enqueues jobs in chunks
//! - [`worker`] - bounded download pools, one per media kind
//! - [`consumer`] - applies results to media records
//! - [`completion`] - pending counters and the `completed` transition
//! - [`service`] and [`api`] - package submission and queries over HTTP
//!
//! Components share nothing in process; they talk through [`QueueClient`] and
//! [`AtomicCounterStore`], both implemented by the SQLite [`Database`] and by
//! in-memory fakes for tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_dl::{Config, Pipeline, Role, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let pipeline = Pipeline::start(config, Role::All).await?;
//!
//!     // Runs until SIGINT/SIGTERM, then drains every pool
//!     run_with_shutdown(pipeline).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Completion tracking
pub mod completion;
/// Configuration types
pub mod config;
/// Result consumer
pub mod consumer;
/// Pending counters
pub mod counter;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Process wiring
pub mod pipeline;
/// Job publisher
pub mod publisher;
/// Durable queues
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Package service
pub mod service;
/// Core types
pub mod types;
/// Download workers
pub mod worker;

// Re-export commonly used types
pub use completion::{CompletionTracker, Progress};
pub use config::{Config, RetryConfig};
pub use consumer::{ResultConsumer, ResultProcessor};
pub use counter::{AtomicCounterStore, Decrement, MemoryCounterStore};
pub use db::Database;
pub use error::{
    ApiError, DatabaseError, Error, ErrorDetail, PublishFailure, QueueError, Result,
    ToHttpStatus, ValidationError,
};
pub use pipeline::{Pipeline, Role};
pub use publisher::{JobPublisher, JobRequest};
pub use queue::{MemoryQueue, QueueClient, TypedQueue};
pub use service::PackageService;
pub use types::{
    DownloadJob, JobHandle, JobResult, Media, MediaId, MediaKind, MediaStatus, NewPackage,
    Package, PackageId, PackageStatus, QueueStats,
};
pub use worker::DownloadWorker;

/// Run a started pipeline until a termination signal, then shut it down gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns early with the error if the API server fails, after shutting the rest down.
pub async fn run_with_shutdown(mut pipeline: Pipeline) -> Result<()> {
    let outcome = tokio::select! {
        _ = wait_for_signal() => Ok(()),
        stopped = pipeline.api_stopped() => stopped,
    };
    pipeline.shutdown().await;
    outcome
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments; fall back to whatever works
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Ok(mut only), Err(e)) | (Err(e), Ok(mut only)) => {
            tracing::warn!(error = %e, "could not register both signal handlers");
            only.recv().await;
            tracing::info!("received termination signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "could not register signal handlers, using ctrl_c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl_c");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
