//! Content-addressed conversion cache with single-flight computation.
//!
//! ## Tiers
//!
//! ```text
//! get_or_compute(key)
//!   │
//!   ├─ memory    LRU, entry-count bound        ─▶ CacheSource::Memory
//!   ├─ in-flight shared future per key         ─▶ CacheSource::Joined
//!   └─ leader    spawn_blocking task:
//!                  durable tier                ─▶ CacheSource::Durable
//!                  or compute + persist        ─▶ CacheSource::Computed
//! ```
//!
//! The leader's work runs on a detached blocking task. Callers only await a
//! [`Shared`] handle to it, so a caller that gives up never interrupts the
//! computation: the task still finishes, populates both tiers and clears its
//! in-flight slot. Failures are handed to every waiter and then forgotten;
//! the next request for the key computes again.

pub mod disk;

pub use disk::DurableTier;

use crate::error::DocError;
use crate::output::CanonicalDocument;
use crate::pipeline::canonical::DIALECT_VERSION;
use crate::pipeline::extract::Extractor;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Identity of a conversion result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// SHA-256 of the raw input bytes.
    pub content_hash: String,
    pub extractor_id: String,
    /// Extractor version folded with the dialect revision, e.g. `v3.d1`.
    pub extractor_version: String,
}

impl CacheKey {
    pub fn new(content_hash: impl Into<String>, extractor: &Extractor) -> Self {
        Self {
            content_hash: content_hash.into(),
            extractor_id: extractor.id().to_string(),
            extractor_version: version_tag(extractor.version()),
        }
    }
}

/// Directory-safe version string for an extractor version.
pub fn version_tag(extractor_version: u32) -> String {
    format!("v{extractor_version}.d{DIALECT_VERSION}")
}

/// Which path served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Durable,
    Computed,
    /// Waited on another caller's in-flight computation.
    Joined,
}

impl CacheSource {
    /// True when no extraction ran on behalf of this caller.
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheSource::Computed)
    }
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub document: Arc<CanonicalDocument>,
    pub source: CacheSource,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub computations: u64,
    pub failures: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    computations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

type Filled = Result<(Arc<CanonicalDocument>, CacheSource), DocError>;
type InFlight = Shared<BoxFuture<'static, Filled>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    memory: Mutex<LruCache<CacheKey, Arc<CanonicalDocument>>>,
    durable: Option<DurableTier>,
    inflight: Mutex<HashMap<CacheKey, InFlight>>,
    counters: Counters,
}

/// Clears a key's in-flight slot when the leader task ends, even by panic.
struct SlotGuard<'a> {
    inner: &'a Inner,
    key: &'a CacheKey,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.inflight).remove(self.key);
    }
}

impl Inner {
    /// Leader body. Runs on the blocking pool.
    fn fill<F>(&self, key: CacheKey, compute: F) -> Filled
    where
        F: FnOnce() -> Result<CanonicalDocument, DocError>,
    {
        let _slot = SlotGuard {
            inner: self,
            key: &key,
        };

        if let Some(doc) = self.durable.as_ref().and_then(|d| d.load(&key)) {
            bump(&self.counters.durable_hits);
            let doc = Arc::new(doc);
            self.remember(&key, Arc::clone(&doc));
            return Ok((doc, CacheSource::Durable));
        }

        bump(&self.counters.computations);
        let doc = match compute() {
            Ok(doc) => Arc::new(doc),
            Err(e) => {
                bump(&self.counters.failures);
                debug!("Computation for {} failed: {}", key.content_hash, e);
                return Err(e);
            }
        };

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.store(&key, &doc) {
                warn!("Durable cache write failed (serving result anyway): {}", e);
            }
        }
        self.remember(&key, Arc::clone(&doc));
        Ok((doc, CacheSource::Computed))
    }

    fn remember(&self, key: &CacheKey, doc: Arc<CanonicalDocument>) {
        // `push` hands back either the replaced value for `key` or the
        // least-recently-used entry it pushed out.
        if let Some((displaced, _)) = lock(&self.memory).push(key.clone(), doc) {
            if displaced != *key {
                bump(&self.counters.evictions);
            }
        }
    }
}

/// Two-tier conversion cache. Cheap to share behind an `Arc`.
pub struct ConversionCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConversionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCache")
            .field("durable", &self.inner.durable)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConversionCache {
    pub fn new(capacity: usize, durable: Option<DurableTier>) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: Mutex::new(LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
                )),
                durable,
                inflight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn durable(&self) -> Option<&DurableTier> {
        self.inner.durable.as_ref()
    }

    /// Return the cached document for `key`, or run `compute` exactly once
    /// across all concurrent callers for that key.
    pub async fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<CacheLookup, DocError>
    where
        F: FnOnce() -> Result<CanonicalDocument, DocError> + Send + 'static,
    {
        let (handle, leader) = {
            let mut inflight = lock(&self.inner.inflight);
            if let Some(document) = lock(&self.inner.memory).get(&key).cloned() {
                bump(&self.inner.counters.hits);
                return Ok(CacheLookup {
                    document,
                    source: CacheSource::Memory,
                });
            }
            match inflight.get(&key) {
                Some(existing) => {
                    bump(&self.inner.counters.joins);
                    (existing.clone(), false)
                }
                None => {
                    bump(&self.inner.counters.misses);
                    let inner = Arc::clone(&self.inner);
                    let task_key = key.clone();
                    let task = tokio::task::spawn_blocking(move || inner.fill(task_key, compute));
                    let handle = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(DocError::Internal(format!("cache fill task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.clone(), handle.clone());
                    (handle, true)
                }
            }
        };

        let (document, source) = handle.await?;
        Ok(CacheLookup {
            document,
            source: if leader { source } else { CacheSource::Joined },
        })
    }

    /// Memory-tier lookup only; no computation, no durable read.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CanonicalDocument>> {
        lock(&self.inner.memory).get(key).cloned()
    }

    /// True while a computation for `key` is running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.inner.inflight).contains_key(key)
    }

    /// Drop the memory tier. The durable tier is untouched.
    pub fn clear_memory(&self) {
        lock(&self.inner.memory).clear();
    }

    /// Remove durable entries written under other versions of `extractor`.
    pub fn invalidate_superseded(&self, extractor: &Extractor) -> Result<usize, DocError> {
        match &self.inner.durable {
            Some(d) => Ok(d.invalidate_superseded(extractor.id(), &version_tag(extractor.version()))?),
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            joins: c.joins.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries: lock(&self.inner.memory).len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::output::CanonicalMetadata;
    use crate::pipeline::extract::ExtractorKind;
    use crate::pipeline::input::sha256_hex;
    use crate::pipeline::sniff::FormatTag;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    pub(crate) fn sample_doc(body: &str) -> CanonicalDocument {
        let markdown = format!("{body}\n");
        CanonicalDocument {
            content_hash: sha256_hex(markdown.as_bytes()),
            markdown,
            metadata: CanonicalMetadata {
                source_format: FormatTag::PlainText,
                extractor_id: "plaintext".into(),
                extractor_version: 1,
                dialect_version: DIALECT_VERSION,
                source_hash: "src".into(),
                title: None,
                converted_at: chrono::Utc::now(),
            },
        }
    }

    pub(crate) fn key(hash: &str) -> CacheKey {
        CacheKey {
            content_hash: hash.into(),
            extractor_id: "plaintext".into(),
            extractor_version: version_tag(1),
        }
    }

    #[test]
    fn key_folds_dialect_into_version() {
        let e = Extractor::new(ExtractorKind::Html).with_version(7);
        let k = CacheKey::new("h", &e);
        assert_eq!(k.extractor_id, "html-dom");
        assert_eq!(k.extractor_version, format!("v7.d{DIALECT_VERSION}"));
        assert_ne!(k, CacheKey::new("h", &e.with_version(8)));
    }

    #[tokio::test]
    async fn computes_once_then_serves_from_memory() {
        let cache = ConversionCache::new(8, None);
        let first = cache
            .get_or_compute(key("a"), || Ok(sample_doc("a")))
            .await
            .unwrap();
        assert_eq!(first.source, CacheSource::Computed);

        let second = cache
            .get_or_compute(key("a"), || panic!("must not recompute"))
            .await
            .unwrap();
        assert_eq!(second.source, CacheSource::Memory);
        assert!(Arc::ptr_eq(&first.document, &second.document));

        let stats = cache.stats();
        assert_eq!((stats.misses, stats.hits, stats.computations), (1, 1, 1));
        assert!(!cache.is_in_flight(&key("a")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(ConversionCache::new(8, None));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("shared"), move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(sample_doc("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut hashes = Vec::new();
        for t in tasks {
            hashes.push(t.await.unwrap().document.content_hash.clone());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn failures_are_not_memoised() {
        let cache = ConversionCache::new(8, None);
        let err = cache
            .get_or_compute(key("f"), || Err(DocError::Internal("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::Internal(_)));
        assert!(cache.get(&key("f")).is_none());

        let ok = cache
            .get_or_compute(key("f"), || Ok(sample_doc("f")))
            .await
            .unwrap();
        assert_eq!(ok.source, CacheSource::Computed);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn abandoned_computation_still_populates() {
        let cache = ConversionCache::new(8, None);
        let fut = cache.get_or_compute(key("c"), || {
            std::thread::sleep(Duration::from_millis(50));
            Ok(sample_doc("c"))
        });
        // Poll once so the leader task is spawned, then abandon the caller.
        let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        for _ in 0..100 {
            if cache.get(&key("c")).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.get(&key("c")).is_some());
        assert!(!cache.is_in_flight(&key("c")));
    }

    #[tokio::test]
    async fn durable_tier_survives_a_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let first = ConversionCache::new(8, Some(DurableTier::new(dir.path())));
        first
            .get_or_compute(key("d"), || Ok(sample_doc("d")))
            .await
            .unwrap();

        let second = ConversionCache::new(8, Some(DurableTier::new(dir.path())));
        let hit = second
            .get_or_compute(key("d"), || panic!("must come from disk"))
            .await
            .unwrap();
        assert_eq!(hit.source, CacheSource::Durable);
        assert_eq!(second.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn lru_eviction_is_counted() {
        let cache = ConversionCache::new(1, None);
        for k in ["x", "y"] {
            cache
                .get_or_compute(key(k), move || Ok(sample_doc(k)))
                .await
                .unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn recently_read_entries_survive_eviction() {
        let cache = ConversionCache::new(2, None);
        for k in ["a", "b"] {
            cache
                .get_or_compute(key(k), move || Ok(sample_doc(k)))
                .await
                .unwrap();
        }
        // Reading "a" leaves "b" as the least recently used entry.
        assert!(cache.get(&key("a")).is_some());
        cache
            .get_or_compute(key("c"), || Ok(sample_doc("c")))
            .await
            .unwrap();

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn zero_capacity_still_holds_one_entry() {
        let cache = ConversionCache::new(0, None);
        cache
            .get_or_compute(key("a"), || Ok(sample_doc("a")))
            .await
            .unwrap();
        assert_eq!(cache.stats().entries, 1);
        cache.clear_memory();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().evictions, 0);
    }
}
