//! Raw inputs: immutable bytes plus optional filename and MIME hints.
//!
//! A [`RawInput`] is built from memory, from a local file, or by downloading
//! an HTTP(S) URL. It is never mutated after construction; clones share the
//! same byte buffer.

use crate::error::DocError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes to convert, with the hints the caller declared about them.
#[derive(Clone)]
pub struct RawInput {
    bytes: Arc<[u8]>,
    filename: Option<String>,
    mime: Option<String>,
}

impl std::fmt::Debug for RawInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawInput")
            .field("len", &self.bytes.len())
            .field("filename", &self.filename)
            .field("mime", &self.mime)
            .finish()
    }
}

impl RawInput {
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: Option<String>, mime: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename,
            mime,
        }
    }

    /// Input with a filename hint only.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, filename: impl Into<String>) -> Self {
        Self::new(bytes, Some(filename.into()), None)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Filename if known, otherwise a placeholder for log and error messages.
    pub fn display_name(&self) -> &str {
        self.filename.as_deref().unwrap_or("<memory>")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercase hex SHA-256 of the bytes. Filenames and hints do not
    /// participate, so identical bytes under different names hash equally.
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.bytes)
    }

    /// Read a local file. The file name becomes the filename hint.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, DocError> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DocError::FileNotFound { path: path.clone() },
            std::io::ErrorKind::PermissionDenied => {
                DocError::PermissionDenied { path: path.clone() }
            }
            _ => DocError::Internal(format!("read {}: {}", path.display(), e)),
        })?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(Self::new(bytes, filename, None))
    }

    /// Download an HTTP(S) URL. The last path segment becomes the filename
    /// hint and `Content-Type` the MIME hint.
    pub async fn from_url(url: &str, timeout_secs: u64, user_agent: &str) -> Result<Self, DocError> {
        info!("Downloading document from: {}", url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(user_agent)
            .build()
            .map_err(|e| DocError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let response = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DocError::DownloadTimeout {
                    url: url.to_string(),
                    secs: timeout_secs,
                }
            } else {
                DocError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(DocError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let filename = filename_from_url(url);

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DocError::DownloadTimeout {
                    url: url.to_string(),
                    secs: timeout_secs,
                }
            } else {
                DocError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        info!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(Self::new(bytes.to_vec(), filename, mime))
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a user-supplied path or URL to a [`RawInput`].
pub async fn resolve_input(
    input: &str,
    timeout_secs: u64,
    user_agent: &str,
) -> Result<RawInput, DocError> {
    if input.trim().is_empty() {
        return Err(DocError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        if reqwest::Url::parse(input).is_err() {
            return Err(DocError::InvalidInput {
                input: input.to_string(),
            });
        }
        RawInput::from_url(input, timeout_secs, user_agent).await
    } else {
        RawInput::from_path(PathBuf::from(input)).await
    }
}

/// Last non-empty path segment of a URL, if it looks like a file name.
fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.rfind(|s| !s.is_empty())?;
    if last.contains('.') {
        Some(last.to_string())
    } else {
        None
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn content_hash_ignores_hints() {
        let a = RawInput::new(b"same".to_vec(), Some("a.txt".into()), None);
        let b = RawInput::new(b"same".to_vec(), Some("b.md".into()), Some("text/markdown".into()));
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
        assert_ne!(a.content_hash(), RawInput::from_bytes(b"other".to_vec(), "a.txt").content_hash());
    }

    #[test]
    fn known_sha256() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            filename_from_url("https://example.com/docs/report.pdf?x=1").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(filename_from_url("https://example.com/docs/"), None);
        assert_eq!(filename_from_url("https://example.com/page"), None);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = RawInput::from_path("/definitely/not/here.md").await.unwrap_err();
        assert!(matches!(err, DocError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn reads_local_file_with_name_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes").unwrap();
        let input = RawInput::from_path(&path).await.unwrap();
        assert_eq!(input.filename(), Some("notes.md"));
        assert_eq!(input.bytes(), b"# Notes");
    }

    #[tokio::test]
    async fn empty_input_string_is_invalid() {
        let err = resolve_input("  ", 5, "test").await.unwrap_err();
        assert!(matches!(err, DocError::InvalidInput { .. }));
    }
}
