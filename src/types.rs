//! Core types for media-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utoipa::ToSchema;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

row_id!(
    /// Unique identifier for a package
    PackageId
);

row_id!(
    /// Unique identifier for a media item
    MediaId
);

/// Kind of media, selecting the queue, worker pool and extension rules
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still images
    Image,
    /// Video files
    Video,
}

const IMAGE_URL_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];
const VIDEO_URL_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".ogg", ".mov", ".avi"];

const IMAGE_INFER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_INFER_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "flv", "webm"];

impl MediaKind {
    /// All kinds, in publishing order
    pub const ALL: [MediaKind; 2] = [MediaKind::Image, MediaKind::Video];

    /// Lowercase name used in file names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Convert integer code from the database to MediaKind
    pub fn from_i32(kind: i32) -> Self {
        match kind {
            1 => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }

    /// Convert MediaKind to integer code for database storage
    pub fn to_i32(&self) -> i32 {
        match self {
            MediaKind::Image => 0,
            MediaKind::Video => 1,
        }
    }

    /// Infer the kind from the file extension of a URL's path.
    ///
    /// Falls back to [`MediaKind::Image`] when the extension is missing or unknown.
    pub fn from_url(url: &str) -> Self {
        let extension = url::Url::parse(url).ok().and_then(|parsed| {
            let last = parsed.path_segments()?.last()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            Some(ext.to_ascii_lowercase())
        });

        match extension.as_deref() {
            Some(ext) if VIDEO_INFER_EXTENSIONS.contains(&ext) => MediaKind::Video,
            Some(ext) if IMAGE_INFER_EXTENSIONS.contains(&ext) => MediaKind::Image,
            _ => MediaKind::Image,
        }
    }

    /// Extensions (with leading dot) accepted verbatim from a URL path
    pub fn allowed_extensions(&self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_URL_EXTENSIONS,
            MediaKind::Video => VIDEO_URL_EXTENSIONS,
        }
    }

    /// Extension used when neither the URL nor a HEAD request yields one
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Image => ".jpg",
            MediaKind::Video => ".mp4",
        }
    }

    /// Map a `Content-Type` value to an extension for this kind.
    ///
    /// Parameters such as `; charset=...` are ignored.
    pub fn extension_for_content_type(&self, content_type: &str) -> Option<&'static str> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match (self, mime.as_str()) {
            (MediaKind::Image, "image/jpeg") => Some(".jpg"),
            (MediaKind::Image, "image/png") => Some(".png"),
            (MediaKind::Image, "image/gif") => Some(".gif"),
            (MediaKind::Image, "image/webp") => Some(".webp"),
            (MediaKind::Image, "image/bmp") => Some(".bmp"),
            (MediaKind::Video, "video/mp4") => Some(".mp4"),
            (MediaKind::Video, "video/webm") => Some(".webm"),
            (MediaKind::Video, "video/ogg") => Some(".ogg"),
            (MediaKind::Video, "video/quicktime") => Some(".mov"),
            (MediaKind::Video, "video/x-msvideo") => Some(".avi"),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(format!("unknown media type '{}'", other)),
        }
    }
}

/// Media item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    /// Waiting for a download result
    Pending,
    /// Stored locally
    Downloaded,
    /// Gave up on this item
    Failed,
}

impl MediaStatus {
    /// Convert integer status code to MediaStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => MediaStatus::Pending,
            1 => MediaStatus::Downloaded,
            _ => MediaStatus::Failed, // Unknown codes are treated as failed
        }
    }

    /// Convert MediaStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            MediaStatus::Pending => 0,
            MediaStatus::Downloaded => 1,
            MediaStatus::Failed => 2,
        }
    }

    /// Whether a result has already been applied to this item
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MediaStatus::Pending)
    }
}

/// Package status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    /// Created, jobs not yet handed to the broker
    Pending,
    /// Jobs queued, downloads in flight
    Processing,
    /// Every item settled
    Completed,
    /// Submission failed
    Failed,
}

impl PackageStatus {
    /// Convert integer status code to PackageStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => PackageStatus::Pending,
            1 => PackageStatus::Processing,
            2 => PackageStatus::Completed,
            _ => PackageStatus::Failed,
        }
    }

    /// Convert PackageStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            PackageStatus::Pending => 0,
            PackageStatus::Processing => 1,
            PackageStatus::Completed => 2,
            PackageStatus::Failed => 3,
        }
    }
}

/// Optional job metadata carried through the queue untouched
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobMetadata {
    /// Where the request came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Submission timestamp (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Caller-assigned priority hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Download job message, one per media item
///
/// Wire format: `{ "mediaId": 1, "url": "...", "filename": "...", "metadata": {...} }`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    /// Media record this job settles
    pub media_id: MediaId,
    /// Remote source URL
    pub url: String,
    /// Target file name without extension
    pub filename: String,
    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
}

/// Outcome of one download attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// File stored at the given path
    Downloaded {
        /// Local path of the stored file
        file_path: PathBuf,
    },
    /// Download failed
    Failed {
        /// Human-readable failure reason
        error_msg: String,
    },
}

/// Result message emitted by a download worker
///
/// Wire format: `{ "mediaId": 1, "filePath": "..." }` or `{ "mediaId": 1, "errorMsg": "..." }`.
/// Exactly one of `filePath`/`errorMsg` must be present; anything else is rejected
/// at deserialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "JobResultWire", into = "JobResultWire")]
pub struct JobResult {
    /// Media record this result settles
    pub media_id: MediaId,
    /// What happened
    pub outcome: JobOutcome,
}

impl JobResult {
    /// Successful result
    pub fn downloaded(media_id: MediaId, file_path: impl Into<PathBuf>) -> Self {
        Self {
            media_id,
            outcome: JobOutcome::Downloaded {
                file_path: file_path.into(),
            },
        }
    }

    /// Failed result
    pub fn failed(media_id: MediaId, error_msg: impl Into<String>) -> Self {
        Self {
            media_id,
            outcome: JobOutcome::Failed {
                error_msg: error_msg.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResultWire {
    media_id: MediaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_msg: Option<String>,
}

impl TryFrom<JobResultWire> for JobResult {
    type Error = String;

    fn try_from(wire: JobResultWire) -> Result<Self, Self::Error> {
        let outcome = match (wire.file_path, wire.error_msg) {
            (Some(file_path), None) => JobOutcome::Downloaded { file_path },
            (None, Some(error_msg)) => JobOutcome::Failed { error_msg },
            (Some(_), Some(_)) => {
                return Err("result carries both filePath and errorMsg".to_string());
            }
            (None, None) => return Err("result carries neither filePath nor errorMsg".to_string()),
        };
        Ok(JobResult {
            media_id: wire.media_id,
            outcome,
        })
    }
}

impl From<JobResult> for JobResultWire {
    fn from(result: JobResult) -> Self {
        let (file_path, error_msg) = match result.outcome {
            JobOutcome::Downloaded { file_path } => (Some(file_path), None),
            JobOutcome::Failed { error_msg } => (None, Some(error_msg)),
        };
        JobResultWire {
            media_id: result.media_id,
            file_path,
            error_msg,
        }
    }
}

/// Handle for a message accepted by the broker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobHandle {
    /// Queue the message was published to
    pub queue: String,
    /// Broker-assigned message ID
    pub id: i64,
}

/// Queue depth snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    /// Messages waiting for (re)delivery
    pub waiting: u64,
    /// Messages currently leased by a consumer
    pub active: u64,
    /// Messages that exhausted their attempts
    pub failed: u64,
}

/// One requested download inside a package submission
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    /// Remote source URL
    pub url: String,
    /// Target file name (generated when absent)
    #[serde(default)]
    pub filename: Option<String>,
    /// Media kind (inferred from the URL when absent)
    #[serde(default)]
    pub media_type: Option<MediaKind>,
}

/// Package submission
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewPackage {
    /// Package title
    pub title: String,
    /// Package description
    pub description: String,
    /// Requested downloads, in order
    pub media: Vec<MediaItem>,
}

/// Media item as exposed to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    /// Media ID
    pub id: MediaId,
    /// Owning package
    pub package_id: PackageId,
    /// URL the item was requested from
    pub original_url: String,
    /// Stored file path once downloaded, requested file name before that
    pub filename: Option<String>,
    /// Media kind
    pub media_type: MediaKind,
    /// Current status
    pub status: MediaStatus,
    /// Public reference to the stored file
    pub new_url: Option<String>,
    /// Failure reason
    pub error_message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Package as exposed to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Package ID
    pub id: PackageId,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Aggregate status
    pub status: PackageStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Media items (may be a single page for large packages)
    pub media: Vec<Media>,
}

/// A page of results
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[aliases(PackagePage = Paginated<Package>, MediaPage = Paginated<Media>)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Total number of items
    pub total: u64,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub size: u32,
    /// Number of pages
    pub total_pages: u32,
}

impl<T> Paginated<T> {
    /// Build a page from its items and the overall total
    pub fn new(items: Vec<T>, total: u64, page: u32, size: u32) -> Self {
        let total_pages = if size == 0 {
            0
        } else {
            total.div_ceil(u64::from(size)) as u32
        };
        Self {
            items,
            total,
            page,
            size,
            total_pages,
        }
    }
}
