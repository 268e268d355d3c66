//! Durable tier: one JSON file per cache key under a root directory.
//!
//! Layout: `<root>/<extractor_id>/<version_tag>/<hh>/<content_hash>.json`
//! where `hh` is the first two hex digits of the content hash. Entries are
//! never evicted; a version bump makes old directories unreachable and
//! [`DurableTier::invalidate_superseded`] removes them.

use super::CacheKey;
use crate::error::StorageError;
use crate::output::CanonicalDocument;
use crate::pipeline::input::sha256_hex;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BACKEND: &str = "cache-dir";

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: CacheKey,
    document: CanonicalDocument,
}

/// File-backed cache tier. All methods block; call from blocking contexts.
#[derive(Debug, Clone)]
pub struct DurableTier {
    root: PathBuf,
}

impl DurableTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let shard = key.content_hash.get(..2).unwrap_or("00");
        self.root
            .join(&key.extractor_id)
            .join(&key.extractor_version)
            .join(shard)
            .join(format!("{}.json", key.content_hash))
    }

    /// Read an entry. Missing, unreadable and corrupt entries are all misses.
    pub fn load(&self, key: &CacheKey) -> Option<CanonicalDocument> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Durable cache read failed for {}: {}", path.display(), e);
                return None;
            }
        };
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring corrupt cache entry {}: {}", path.display(), e);
                return None;
            }
        };
        if entry.key != *key || entry.document.content_hash != sha256_hex(entry.document.markdown.as_bytes()) {
            warn!("Ignoring mismatched cache entry {}", path.display());
            return None;
        }
        debug!("Durable cache hit: {}", path.display());
        Some(entry.document)
    }

    /// Write an entry atomically (temp file in the target directory, then rename).
    pub fn store(&self, key: &CacheKey, document: &CanonicalDocument) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(|e| StorageError::io(BACKEND, "create cache dir", e))?;

        let entry = DiskEntry {
            key: key.clone(),
            document: document.clone(),
        };
        let json = serde_json::to_vec(&entry).map_err(|e| StorageError::Unavailable {
            backend: BACKEND.into(),
            detail: format!("serialise entry: {e}"),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StorageError::io(BACKEND, "create temp file", e))?;
        tmp.write_all(&json)
            .map_err(|e| StorageError::io(BACKEND, "write temp file", e))?;
        tmp.persist(&path)
            .map_err(|e| StorageError::io(BACKEND, "persist entry", e.error))?;
        Ok(path)
    }

    /// Remove every version directory of `extractor_id` other than
    /// `current_tag`. Returns how many directories were removed.
    pub fn invalidate_superseded(&self, extractor_id: &str, current_tag: &str) -> Result<usize, StorageError> {
        let dir = self.root.join(extractor_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(BACKEND, "list cache dir", e)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(BACKEND, "list cache dir", e))?;
            let stale = entry.file_name().to_str() != Some(current_tag);
            if stale && entry.path().is_dir() {
                std::fs::remove_dir_all(entry.path())
                    .map_err(|e| StorageError::io(BACKEND, "remove stale version", e))?;
                debug!("Removed superseded cache dir {}", entry.path().display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}
