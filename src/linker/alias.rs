//! Alias table: normalised term → resolved reference.
//!
//! Shared by every document a pipeline converts. Entries are only ever
//! added (first writer wins), never changed, so readers need no coordination
//! beyond the lock.

use super::terms::normalize;
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

const BACKEND: &str = "alias-table";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub reference_id: String,
    pub title: String,
}

#[derive(Debug, Default)]
pub struct AliasTable {
    entries: RwLock<HashMap<String, AliasEntry>>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, term: &str) -> Option<AliasEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize(term))
            .cloned()
    }

    /// Insert unless the term is already present. Returns whether it was added.
    pub fn insert(&self, term: &str, entry: AliasEntry) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = normalize(term);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<String, AliasEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Load from a JSON object file. A missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(StorageError::io(BACKEND, "read alias file", e)),
        };
        let map: HashMap<String, AliasEntry> =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                backend: BACKEND.into(),
                location: path.display().to_string(),
                detail: e.to_string(),
            })?;
        let table = Self::new();
        for (term, entry) in map {
            table.insert(&term, entry);
        }
        debug!("Loaded {} aliases from {}", table.len(), path.display());
        Ok(table)
    }

    /// Write all entries as pretty JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| StorageError::io(BACKEND, "create alias dir", e))?;
        let json = serde_json::to_vec_pretty(&self.snapshot()).map_err(|e| StorageError::Unavailable {
            backend: BACKEND.into(),
            detail: e.to_string(),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StorageError::io(BACKEND, "create temp file", e))?;
        tmp.write_all(&json)
            .map_err(|e| StorageError::io(BACKEND, "write alias file", e))?;
        tmp.persist(path)
            .map_err(|e| StorageError::io(BACKEND, "persist alias file", e.error))?;
        Ok(())
    }
}
