//! Error types for the docmark library.
//!
//! Three error types map onto three failure modes:
//!
//! * [`DocError`]: **fatal for one document**. Sniffing found nothing,
//!   the format library rejected the bytes, or the input could not be read.
//!   Returned as `Err(DocError)` from the `Pipeline::convert*` functions.
//!   [`DocError::stage`] names the pipeline stage that failed.
//!
//! * [`LookupError`]: **non-fatal, per mention**. A concept lookup failed.
//!   Transient variants are retried and finally demoted to an unresolved
//!   mention; permanent variants mark the mention rejected. Never surfaces
//!   from a conversion call.
//!
//! * [`FetchError`]: **non-fatal, per outbound link**. Fetching a linked
//!   page's metadata failed. Collected next to the successes of the batch.
//!
//! * [`StorageError`]: persistence failed after conversion succeeded. Kept
//!   apart from conversion failures so callers can retry `store` without
//!   converting again.
//!
//! `DocError` is `Clone` because a single cached computation hands the same
//! result to every concurrent waiter.

use crate::pipeline::sniff::FormatTag;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned for a single document.
#[derive(Debug, Clone, Error)]
pub enum DocError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// No extractor recognises the bytes. Terminal for this input.
    #[error("Unrecognised document format for '{name}'{}", mime_suffix(.mime))]
    UnknownFormat { name: String, mime: Option<String> },

    /// The format-specific parser rejected the bytes (corrupt file,
    /// unsupported sub-format, password protection).
    #[error("{format} extraction failed in extractor '{extractor}': {cause}")]
    Extraction {
        format: FormatTag,
        extractor: String,
        cause: String,
    },

    /// The intermediate document was structurally malformed. This is a
    /// defect in an extractor and should be reported.
    #[error("Canonicalization failed for output of '{extractor}': {detail}")]
    Canonicalization { extractor: String, detail: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The artifact store could not persist or read a document.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Could not write an output file requested by the caller.
    #[error("Failed to write output file '{path}': {detail}")]
    OutputWriteFailed { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn mime_suffix(mime: &Option<String>) -> String {
    match mime {
        Some(m) => format!(" (declared type: {m})"),
        None => String::new(),
    }
}

/// The pipeline stage a [`DocError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Input,
    Sniff,
    Extract,
    Canonicalize,
    Store,
    Config,
    Internal,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Input => "input",
            Stage::Sniff => "sniff",
            Stage::Extract => "extract",
            Stage::Canonicalize => "canonicalize",
            Stage::Store => "store",
            Stage::Config => "config",
            Stage::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl DocError {
    /// Which stage of the pipeline failed.
    pub fn stage(&self) -> Stage {
        match self {
            DocError::FileNotFound { .. }
            | DocError::PermissionDenied { .. }
            | DocError::InvalidInput { .. }
            | DocError::DownloadFailed { .. }
            | DocError::DownloadTimeout { .. } => Stage::Input,
            DocError::UnknownFormat { .. } => Stage::Sniff,
            DocError::Extraction { .. } => Stage::Extract,
            DocError::Canonicalization { .. } => Stage::Canonicalize,
            DocError::Storage(_) | DocError::OutputWriteFailed { .. } => Stage::Store,
            DocError::InvalidConfig(_) => Stage::Config,
            DocError::Internal(_) => Stage::Internal,
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Unknown formats, extraction and canonicalization failures are
    /// deterministic functions of the input bytes and never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            DocError::DownloadFailed { .. } | DocError::DownloadTimeout { .. } => true,
            DocError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Failures of the durable artifact backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the operation.
    #[error("Storage backend '{backend}' unavailable: {detail}")]
    Unavailable { backend: String, detail: String },

    /// Data read back from the backend could not be decoded.
    #[error("Corrupt data in storage backend '{backend}' at '{location}': {detail}")]
    Corrupt {
        backend: String,
        location: String,
        detail: String,
    },

    /// Bounded retry gave up.
    #[error("Storage operation '{operation}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

impl StorageError {
    /// Only availability failures are retried; corrupt data stays corrupt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    pub(crate) fn io(backend: &str, context: &str, e: std::io::Error) -> Self {
        StorageError::Unavailable {
            backend: backend.to_string(),
            detail: format!("{context}: {e}"),
        }
    }
}

/// A non-fatal error from a single concept lookup.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum LookupError {
    /// Network failure or 5xx. Retried.
    #[error("transient lookup failure: {0}")]
    Transient(String),

    /// A single attempt exceeded its deadline. Retried.
    #[error("lookup attempt timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// HTTP 429. Retried, honouring the server delay when given.
    #[error("rate limited by reference service")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The service has no entry for the term. Not retried.
    #[error("no reference entry for '{term}'")]
    NotFound { term: String },

    /// The request itself was rejected (4xx other than 429). Not retried.
    #[error("lookup rejected: {0}")]
    Permanent(String),
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LookupError::Transient(_) | LookupError::Timeout { .. } | LookupError::RateLimited { .. }
        )
    }
}

/// A non-fatal error fetching the metadata of one outbound link.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum FetchError {
    /// Network failure or 5xx. Retried.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// A single attempt exceeded its deadline. Retried.
    #[error("fetch attempt timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// HTTP 429. Retried, honouring the server delay when given.
    #[error("rate limited by host")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Unparseable URL or a 4xx other than 429. Not retried.
    #[error("fetch rejected: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Permanent(_))
    }
}
