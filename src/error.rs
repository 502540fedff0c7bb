//! Error types for media-dl
//!
//! This module provides error handling for the pipeline, including:
//! - Domain-specific error types (validation, queue, database, publish)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use crate::types::{JobHandle, MediaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "MAX_CONCURRENCY")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Broker operation failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Submission rejected before anything was queued
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Publishing stopped part-way through a submission
    #[error("{0}")]
    Publish(#[from] PublishFailure),

    /// Download failed for a reason not covered by a more specific variant
    #[error("download error: {0}")]
    Download(String),

    /// Remote origin answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Requested URL
        url: String,
        /// Response status code
        status: u16,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Package or media not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Broker errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker could not be reached or rejected the operation
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Message payload could not be encoded or decoded
    #[error("invalid message on queue {queue}: {reason}")]
    InvalidMessage {
        /// Queue the message was read from or written to
        queue: String,
        /// Decoder/encoder error
        reason: String,
    },

    /// Delivery is unknown to the broker (already acked, or lease lost)
    #[error("delivery {id} not found on queue {queue}")]
    UnknownDelivery {
        /// Queue name
        queue: String,
        /// Message ID
        id: i64,
    },
}

/// Submission validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// No items were submitted
    #[error("a package needs at least one media item")]
    EmptySubmission,

    /// A required package field is blank
    #[error("field '{0}' must not be empty")]
    MissingField(&'static str),

    /// Item URL is not a valid absolute URI
    #[error("item {index}: malformed URL '{url}'")]
    MalformedUrl {
        /// Position of the item in the submission
        index: usize,
        /// Offending URL
        url: String,
    },

    /// Item file name is empty
    #[error("item {index}: missing filename")]
    MissingFilename {
        /// Position of the item in the submission
        index: usize,
    },

    /// Item references a media record that does not exist yet
    #[error("item {index}: missing media id")]
    MissingMediaId {
        /// Position of the item in the submission
        index: usize,
    },
}

/// Publishing stopped after some chunks were already accepted by the broker
///
/// Earlier chunks are not rolled back. `queued` lists what the broker accepted;
/// `unqueued` lists the media whose jobs never reached it.
#[derive(Debug, Error)]
#[error("published {} of {} jobs before the broker failed: {source}", .queued.len(), .queued.len() + .unqueued.len())]
pub struct PublishFailure {
    /// Handles of jobs accepted before the failure
    pub queued: Vec<JobHandle>,
    /// Media whose jobs were not accepted
    pub unqueued: Vec<MediaId>,
    /// The broker error that stopped publishing
    #[source]
    pub source: QueueError,
}

/// API error response format
///
/// This structure is returned by API endpoints when an error occurs.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "not found: package 12"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::Validation(_) => 400,
            Error::NotFound(_) | Error::Database(DatabaseError::NotFound(_)) => 404,
            Error::HttpStatus { .. } | Error::Network(_) | Error::Download(_) => 502,
            Error::Queue(_) | Error::Publish(_) | Error::ShuttingDown => 503,
            Error::Database(_)
            | Error::Sqlx(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) | Error::Database(DatabaseError::NotFound(_)) => "not_found",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Queue(_) => "queue_unavailable",
            Error::Publish(_) => "partial_publish",
            Error::Download(_) => "download_error",
            Error::HttpStatus { .. } => "upstream_status",
            Error::Network(_) => "network_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ShuttingDown => "shutting_down",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({ "key": key })),
            Error::Publish(failure) => Some(serde_json::json!({
                "queued": failure.queued.len(),
                "unqueued": failure.unqueued,
            })),
            Error::HttpStatus { url, status } => Some(serde_json::json!({
                "url": url,
                "status": status,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
