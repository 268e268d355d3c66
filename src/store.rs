//! Artifact persistence: content-addressed Markdown blobs plus an
//! append-only record log.
//!
//! ```text
//! store(doc, id)
//!   ├─ put_blob(hash)       idempotent; an existing blob is left alone
//!   └─ append_record(rec)   never rewrites earlier records
//! ```
//!
//! Both steps run under the shared [`RetryPolicy`]. Only
//! [`StorageError::Unavailable`] is retried; when the policy runs out the
//! caller gets [`StorageError::RetriesExhausted`].

use crate::error::StorageError;
use crate::output::{CanonicalDocument, CanonicalMetadata};
use crate::pipeline::input::sha256_hex;
use crate::retry::{self, RetryDecision, RetryPolicy, Sleeper};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One persisted version of a logical document. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub logical_id: String,
    pub content_hash: String,
    /// Backend-specific blob location.
    pub location: String,
    pub metadata: CanonicalMetadata,
    pub stored_at: DateTime<Utc>,
}

/// Result of writing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobWrite {
    pub location: String,
    /// False when the blob already existed.
    pub created: bool,
}

/// A durable home for blobs and records.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Write `markdown` under `hash` unless it is already there.
    async fn put_blob(&self, hash: &str, markdown: &str) -> Result<BlobWrite, StorageError>;

    async fn get_blob(&self, hash: &str) -> Result<Option<String>, StorageError>;

    async fn append_record(&self, record: &ArtifactRecord) -> Result<(), StorageError>;

    /// Records for `logical_id`, oldest first.
    async fn records(&self, logical_id: &str) -> Result<Vec<ArtifactRecord>, StorageError>;
}

// ── Filesystem backend ───────────────────────────────────────────────────

/// Blobs at `<root>/blobs/<hh>/<hash>.md`, records in `<root>/index.jsonl`.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    index_lock: tokio::sync::Mutex<()>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or("00");
        self.root.join("blobs").join(shard).join(format!("{hash}.md"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.jsonl")
    }
}

const FS: &str = "fs";

#[async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> &str {
        FS
    }

    async fn put_blob(&self, hash: &str, markdown: &str) -> Result<BlobWrite, StorageError> {
        let path = self.blob_path(hash);
        let location = path.display().to_string();
        let body = markdown.to_owned();
        let created = tokio::task::spawn_blocking(move || write_blob(&path, &body))
            .await
            .map_err(|e| StorageError::Unavailable {
                backend: FS.into(),
                detail: format!("blob writer task failed: {e}"),
            })??;
        Ok(BlobWrite { location, created })
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.blob_path(hash)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(FS, "read blob", e)),
        }
    }

    async fn append_record(&self, record: &ArtifactRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record).map_err(|e| StorageError::Unavailable {
            backend: FS.into(),
            detail: format!("encode record: {e}"),
        })?;
        line.push('\n');

        let _guard = self.index_lock.lock().await;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(FS, "create store root", e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())
            .await
            .map_err(|e| StorageError::io(FS, "open index", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(FS, "append index", e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io(FS, "flush index", e))?;
        Ok(())
    }

    async fn records(&self, logical_id: &str) -> Result<Vec<ArtifactRecord>, StorageError> {
        let index = self.index_path();
        let text = match tokio::fs::read_to_string(&index).await {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(FS, "read index", e)),
        };
        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArtifactRecord>(line) {
                Ok(r) if r.logical_id == logical_id => out.push(r),
                Ok(_) => {}
                // A torn final line after a crash must not hide the rest.
                Err(e) => warn!("Skipping unreadable record at {}:{}: {}", index.display(), n + 1, e),
            }
        }
        Ok(out)
    }
}

fn write_blob(path: &Path, markdown: &str) -> Result<bool, StorageError> {
    if path.exists() {
        return Ok(false);
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StorageError::io(FS, "create blob dir", e))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::io(FS, "create temp blob", e))?;
    tmp.write_all(markdown.as_bytes())
        .map_err(|e| StorageError::io(FS, "write blob", e))?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StorageError::io(FS, "persist blob", e.error)),
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

/// Process-local backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, String>>,
    records: Mutex<Vec<ArtifactRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_blob(&self, hash: &str, markdown: &str) -> Result<BlobWrite, StorageError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let created = !blobs.contains_key(hash);
        if created {
            blobs.insert(hash.to_string(), markdown.to_string());
        }
        Ok(BlobWrite {
            location: format!("memory://{hash}"),
            created,
        })
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned())
    }

    async fn append_record(&self, record: &ArtifactRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn records(&self, logical_id: &str) -> Result<Vec<ArtifactRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.logical_id == logical_id)
            .cloned()
            .collect())
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Retrying front for a [`StorageBackend`].
pub struct ArtifactStore {
    backend: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn StorageBackend>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            backend,
            policy,
            sleeper,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Persist `doc` as the newest version of `logical_id`.
    pub async fn store(&self, doc: &CanonicalDocument, logical_id: &str) -> Result<ArtifactRecord, StorageError> {
        let hash = doc.content_hash.as_str();
        let blob = self
            .with_retry("put_blob", || self.backend.put_blob(hash, &doc.markdown))
            .await?;
        if !blob.created {
            debug!("Blob {} already stored, appending record only", hash);
        }

        let record = ArtifactRecord {
            logical_id: logical_id.to_string(),
            content_hash: doc.content_hash.clone(),
            location: blob.location,
            metadata: doc.metadata.clone(),
            stored_at: Utc::now(),
        };
        self.with_retry("append_record", || self.backend.append_record(&record))
            .await?;
        info!(
            "Stored '{}' ({}) in {} backend",
            logical_id,
            &hash[..hash.len().min(12)],
            self.backend.name()
        );
        Ok(record)
    }

    /// Latest record for `logical_id`.
    pub async fn fetch(&self, logical_id: &str) -> Result<Option<ArtifactRecord>, StorageError> {
        Ok(self.history(logical_id).await?.pop())
    }

    /// Every record for `logical_id`, oldest first.
    pub async fn history(&self, logical_id: &str) -> Result<Vec<ArtifactRecord>, StorageError> {
        self.with_retry("records", || self.backend.records(logical_id))
            .await
    }

    /// Read back the Markdown a record points to, verifying its hash.
    pub async fn read_markdown(&self, record: &ArtifactRecord) -> Result<String, StorageError> {
        let blob = self
            .with_retry("get_blob", || self.backend.get_blob(&record.content_hash))
            .await?;
        let markdown = blob.ok_or_else(|| StorageError::Corrupt {
            backend: self.backend.name().to_string(),
            location: record.location.clone(),
            detail: "blob is missing".into(),
        })?;
        if sha256_hex(markdown.as_bytes()) != record.content_hash {
            return Err(StorageError::Corrupt {
                backend: self.backend.name().to_string(),
                location: record.location.clone(),
                detail: "content hash mismatch".into(),
            });
        }
        Ok(markdown)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let label = format!("{} {}", self.backend.name(), operation);
        let attempted = retry::run(
            &self.policy,
            self.sleeper.as_ref(),
            &label,
            |_| op(),
            |e: &StorageError| {
                if e.is_retryable() {
                    RetryDecision::Retry(None)
                } else {
                    RetryDecision::GiveUp
                }
            },
        )
        .await;
        match attempted.result {
            Err(e) if e.is_retryable() => Err(StorageError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempted.attempts,
                last: e.to_string(),
            }),
            other => other,
        }
    }
}
