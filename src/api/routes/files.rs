//! Serving of downloaded files.

use crate::api::AppState;
use crate::error::{ApiError, Error, Result};
use crate::types::{MediaId, MediaStatus};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

/// Content type for a served file extension, or `None` when the extension is not served
pub fn content_type_for(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "ogg" => Some("video/ogg"),
        "avi" => Some("video/x-msvideo"),
        _ => None,
    }
}

/// GET /files/:media_id - Stream a downloaded file
#[utoipa::path(
    get,
    path = "/files/{media_id}",
    tag = "files",
    params(
        ("media_id" = i64, Path, description = "Media ID")
    ),
    responses(
        (status = 200, description = "File contents"),
        (status = 400, description = "File type is not served", body = ApiError),
        (status = 404, description = "Media unknown, not downloaded, or file missing", body = ApiError)
    )
)]
pub async fn serve_file(
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
) -> Result<Response> {
    let media = state.service.get_media(MediaId(media_id)).await?;

    let stored = match (media.status, media.filename) {
        (MediaStatus::Downloaded, Some(path)) => std::path::PathBuf::from(path),
        _ => return Err(Error::NotFound(format!("file for media {}", media_id))),
    };

    let extension = stored
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let Some(content_type) = content_type_for(extension) else {
        let error = ApiError::new(
            "unsupported_file_type",
            format!("files with extension '{}' are not served", extension),
        );
        return Ok((StatusCode::BAD_REQUEST, Json(error)).into_response());
    };

    let file = match tokio::fs::File::open(&stored).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(media_id, path = %stored.display(), "stored file is missing");
            return Err(Error::NotFound(format!("file for media {}", media_id)));
        }
        Err(e) => return Err(e.into()),
    };
    let length = file.metadata().await?.len();

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_allow_list() {
        assert_eq!(content_type_for("JPG"), Some("image/jpeg"));
        assert_eq!(content_type_for("mov"), Some("video/quicktime"));
        assert_eq!(content_type_for("ogg"), Some("video/ogg"));
        assert_eq!(content_type_for("exe"), None);
        assert_eq!(content_type_for(""), None);
    }
}
