//! Extension resolution and streaming fetch.

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::types::MediaKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// HTTP side of a download worker
#[derive(Clone, Debug)]
pub struct MediaFetcher {
    client: reqwest::Client,
    download_dir: PathBuf,
    head_timeout: Duration,
}

impl MediaFetcher {
    /// Build a fetcher with the worker's timeouts and download root
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("media-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            download_dir: config.download_dir.clone(),
            head_timeout: config.head_timeout,
        })
    }

    /// Download root
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Pick the extension for a download.
    ///
    /// Order: an allowed extension in the URL path, then the `Content-Type` of a
    /// HEAD request, then the kind's default. Never fails.
    pub async fn resolve_extension(&self, kind: MediaKind, url: &str) -> &'static str {
        if let Some(ext) = extension_from_url(kind, url) {
            return ext;
        }

        match self.head_content_type(url).await {
            Ok(Some(content_type)) => {
                if let Some(ext) = kind.extension_for_content_type(&content_type) {
                    return ext;
                }
                tracing::warn!(
                    url,
                    content_type = %content_type,
                    default = kind.default_extension(),
                    "unrecognized content type, using default extension"
                );
            }
            Ok(None) => {
                tracing::warn!(
                    url,
                    default = kind.default_extension(),
                    "no content type reported, using default extension"
                );
            }
            Err(e) => {
                tracing::warn!(
                    url,
                    error = %e,
                    default = kind.default_extension(),
                    "content type lookup failed, using default extension"
                );
            }
        }

        kind.default_extension()
    }

    async fn head_content_type(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .head(url)
            .timeout(self.head_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }

    /// Final location of a download: `download_dir / filename + extension`.
    ///
    /// The extension is not doubled when the filename already ends with it. Path
    /// separators in the filename are replaced so the file stays inside the root.
    pub fn target_path(&self, filename: &str, extension: &str) -> PathBuf {
        let safe: String = filename
            .trim()
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
            .collect();

        let name = if safe.to_ascii_lowercase().ends_with(extension) {
            safe
        } else {
            format!("{}{}", safe, extension)
        };

        self.download_dir.join(name)
    }

    /// Stream `url` into `target` without holding the body in memory.
    ///
    /// Bytes go to a temporary sibling named with `part_tag` and are renamed into
    /// place once complete, so concurrent deliveries of the same job never write to
    /// the same file and a partial file is never visible at `target`.
    pub async fn download(&self, url: &str, target: &Path, part_tag: &str) -> Result<u64> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut part = target.as_os_str().to_owned();
        part.push(format!(".{}.part", part_tag));
        let part = PathBuf::from(part);

        match self.stream_to(url, &part).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, target).await?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, part: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(part).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(Error::Download(format!(
                    "response body from {} ended after {} of {} bytes",
                    url, written, expected
                )));
            }
        }

        Ok(written)
    }
}

/// Extension of the URL's last path segment, if it is on the kind's allow-list
pub fn extension_from_url(kind: MediaKind, url: &str) -> Option<&'static str> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    let (_, ext) = last.rsplit_once('.')?;
    let dotted = format!(".{}", ext.to_ascii_lowercase());

    kind.allowed_extensions()
        .iter()
        .copied()
        .find(|allowed| *allowed == dotted)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(dir: &TempDir) -> MediaFetcher {
        MediaFetcher::new(&WorkerConfig {
            download_dir: dir.path().to_path_buf(),
            head_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_extension_from_url_respects_allow_list() {
        assert_eq!(
            extension_from_url(MediaKind::Image, "https://x/a/photo.JPG?w=200"),
            Some(".jpg")
        );
        assert_eq!(
            extension_from_url(MediaKind::Video, "https://x/clip.webm"),
            Some(".webm")
        );
        // Known to the other kind only
        assert_eq!(extension_from_url(MediaKind::Image, "https://x/clip.mp4"), None);
        // mkv is inferred as video but not kept verbatim
        assert_eq!(extension_from_url(MediaKind::Video, "https://x/clip.mkv"), None);
        assert_eq!(extension_from_url(MediaKind::Image, "https://x/photo"), None);
    }

    #[test]
    fn test_target_path() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);

        assert_eq!(
            fetcher.target_path("image-1-abc", ".jpg"),
            dir.path().join("image-1-abc.jpg")
        );
        assert_eq!(
            fetcher.target_path("holiday.jpg", ".jpg"),
            dir.path().join("holiday.jpg")
        );
        assert_eq!(
            fetcher.target_path("../../etc/passwd", ".png"),
            dir.path().join(".._.._etc_passwd.png")
        );
    }

    #[tokio::test]
    async fn test_resolve_extension_uses_url_without_probing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let ext = fetcher(&dir)
            .resolve_extension(MediaKind::Image, &format!("{}/a.png", server.uri()))
            .await;
        assert_eq!(ext, ".png");
    }

    #[tokio::test]
    async fn test_resolve_extension_asks_origin_for_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/media/42"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "video/quicktime"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let ext = fetcher(&dir)
            .resolve_extension(MediaKind::Video, &format!("{}/media/42", server.uri()))
            .await;
        assert_eq!(ext, ".mov");
    }

    #[tokio::test]
    async fn test_resolve_extension_falls_back_to_default() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        assert_eq!(
            fetcher
                .resolve_extension(MediaKind::Image, &format!("{}/x", server.uri()))
                .await,
            ".jpg"
        );
        assert_eq!(
            fetcher
                .resolve_extension(MediaKind::Video, &format!("{}/x", server.uri()))
                .await,
            ".mp4"
        );
    }

    #[tokio::test]
    async fn test_download_streams_to_target() {
        let server = MockServer::start().await;
        let body = vec![7u8; 64 * 1024];
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let target = fetcher.target_path("image-1", ".jpg");

        let bytes = fetcher
            .download(&format!("{}/a.jpg", server.uri()), &target, "1-1")
            .await
            .unwrap();
        assert_eq!(bytes, body.len() as u64);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), body);

        // No temporary files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_download_error_status_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let target = fetcher.target_path("image-2", ".jpg");

        let err = fetcher
            .download(&format!("{}/missing.jpg", server.uri()), &target, "2-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
