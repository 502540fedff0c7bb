//! Configuration types for media-dl

use crate::error::{Error, Result};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Main configuration
///
/// Fields are organized into sub-configs, one per pipeline concern. Every field
/// has a default, so `Config::default()` yields a working single-host setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Data storage (records, pending counters, durable queue)
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Queue names and broker polling behavior
    #[serde(default)]
    pub queues: QueueConfig,

    /// Download and result worker pools
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Job publisher batching
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Redelivery policy attached to every published job
    #[serde(default)]
    pub retry: RetryConfig,

    /// Redelivery policy attached to every job result (default: 10 attempts)
    ///
    /// Longer than the job policy: a result that runs out of attempts leaves its
    /// package unfinished, so it has to outlast a store outage.
    #[serde(default = "default_result_retry")]
    pub result_retry: RetryConfig,

    /// HTTP surface
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            queues: QueueConfig::default(),
            workers: WorkerConfig::default(),
            publisher: PublisherConfig::default(),
            retry: RetryConfig::default(),
            result_retry: default_result_retry(),
            api: ApiConfig::default(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "media-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Queue names and broker polling behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue carrying image download jobs (default: "image-downloads")
    #[serde(default = "default_image_queue")]
    pub image_queue: String,

    /// Queue carrying video download jobs (default: "video-downloads")
    #[serde(default = "default_video_queue")]
    pub video_queue: String,

    /// Queue carrying job results back to the control plane (default: "download-results")
    #[serde(default = "default_result_queue")]
    pub result_queue: String,

    /// How long an idle consumer waits before polling again (default: 250 ms)
    #[serde(default = "default_poll_interval", with = "millis_serde")]
    pub poll_interval: Duration,

    /// How long a delivery stays leased before the broker hands it out again (default: 300 s)
    ///
    /// A consumer that crashes mid-job loses its lease after this long, and the job is
    /// redelivered to another consumer.
    #[serde(default = "default_lease_timeout", with = "duration_serde")]
    pub lease_timeout: Duration,

    /// How long exhausted and dead-lettered messages are kept for inspection (default: 7 days)
    #[serde(default = "default_failed_retention", with = "duration_serde")]
    pub failed_retention: Duration,

    /// How often parked messages older than `failed_retention` are purged (default: 1 hour)
    #[serde(default = "default_retention_interval", with = "duration_serde")]
    pub retention_interval: Duration,
}

impl QueueConfig {
    /// Queue name for a media kind
    pub fn queue_for(&self, kind: MediaKind) -> &str {
        match kind {
            MediaKind::Image => &self.image_queue,
            MediaKind::Video => &self.video_queue,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            image_queue: default_image_queue(),
            video_queue: default_video_queue(),
            result_queue: default_result_queue(),
            poll_interval: default_poll_interval(),
            lease_timeout: default_lease_timeout(),
            failed_retention: default_failed_retention(),
            retention_interval: default_retention_interval(),
        }
    }
}

/// Worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Download root directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Simultaneous downloads per media kind (default: available parallelism)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Simultaneous result handlers (default: 10)
    #[serde(default = "default_result_concurrency")]
    pub result_concurrency: usize,

    /// Whole-request timeout for a download (default: 300 s)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Timeout for the content-type HEAD request (default: 10 s)
    #[serde(default = "default_head_timeout", with = "duration_serde")]
    pub head_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            concurrency: default_concurrency(),
            result_concurrency: default_result_concurrency(),
            request_timeout: default_request_timeout(),
            head_timeout: default_head_timeout(),
        }
    }
}

/// Job publisher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Jobs handed to the broker per call (default: 100)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Redelivery policy for queued jobs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total delivery attempts per job, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first redelivery (default: 1 second)
    #[serde(default = "default_initial_delay", with = "millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between redeliveries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to (default: 127.0.0.1:8000)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Base URI used to build public file references (default: "http://localhost:8000")
    #[serde(default = "default_file_server_uri")]
    pub file_server_uri: String,

    /// Enable CORS (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            file_server_uri: default_file_server_uri(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

impl Config {
    /// Build a configuration from defaults overlaid with environment variables.
    ///
    /// Recognized variables: `DATABASE_PATH`, `IMAGE_QUEUE_NAME`, `VIDEO_QUEUE_NAME`,
    /// `RESULT_QUEUE_NAME`, `DOWNLOAD_DIR`, `MAX_CONCURRENCY`, `RESULT_CONCURRENCY`,
    /// `APP_ADDR`, `FILE_SERVER_URI`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(path) = lookup("DATABASE_PATH") {
            config.persistence.database_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("IMAGE_QUEUE_NAME") {
            config.queues.image_queue = name;
        }
        if let Some(name) = lookup("VIDEO_QUEUE_NAME") {
            config.queues.video_queue = name;
        }
        if let Some(name) = lookup("RESULT_QUEUE_NAME") {
            config.queues.result_queue = name;
        }
        if let Some(dir) = lookup("DOWNLOAD_DIR") {
            config.workers.download_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("MAX_CONCURRENCY") {
            config.workers.concurrency = parse_var("MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("RESULT_CONCURRENCY") {
            config.workers.result_concurrency = parse_var("RESULT_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("APP_ADDR") {
            config.api.bind_address = parse_var("APP_ADDR", &value)?;
        }
        if let Some(uri) = lookup("FILE_SERVER_URI") {
            config.api.file_server_uri = uri;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers.concurrency == 0 {
            return Err(invalid("worker concurrency must be at least 1", "concurrency"));
        }
        if self.workers.result_concurrency == 0 {
            return Err(invalid(
                "result concurrency must be at least 1",
                "result_concurrency",
            ));
        }
        if self.publisher.chunk_size == 0 {
            return Err(invalid("chunk size must be at least 1", "chunk_size"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("max attempts must be at least 1", "max_attempts"));
        }
        if self.result_retry.max_attempts == 0 {
            return Err(invalid(
                "result max attempts must be at least 1",
                "result_retry.max_attempts",
            ));
        }
        if self.queues.retention_interval.is_zero() {
            return Err(invalid(
                "retention interval must be positive",
                "retention_interval",
            ));
        }
        for (key, name) in [
            ("image_queue", &self.queues.image_queue),
            ("video_queue", &self.queues.video_queue),
            ("result_queue", &self.queues.result_queue),
        ] {
            if name.trim().is_empty() {
                return Err(invalid("queue names must not be empty", key));
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::Config {
        message: format!("invalid value '{}' for {}: {}", value, key, e),
        key: Some(key.to_string()),
    })
}

fn invalid(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("media-dl.db")
}

fn default_image_queue() -> String {
    "image-downloads".to_string()
}

fn default_video_queue() -> String {
    "video-downloads".to_string()
}

fn default_result_queue() -> String {
    "download-results".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_lease_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_result_concurrency() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_head_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_chunk_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_result_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        ..RetryConfig::default()
    }
}

fn default_failed_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_file_server_uri() -> String {
    "http://localhost:8000".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
