//! The conversion pipeline context.
//!
//! A [`Pipeline`] owns everything one conversion setup needs: config,
//! extractor registry, cache, optional linker and optional artifact store.
//! There is no global state; two pipelines never share a cache or an alias
//! table unless the caller hands them the same `Arc`.
//!
//! ```text
//! RawInput ─▶ sniff ─▶ cache.get_or_compute(key, extract + canonicalize)
//!                                   │
//!                                   ▼
//!                      link (optional) + outbound links ─▶ ConversionOutput
//! ```

use crate::cache::{CacheKey, CacheStats, ConversionCache};
use crate::cache::disk::DurableTier;
use crate::config::PipelineConfig;
use crate::error::DocError;
use crate::linker::{AliasTable, ConceptLinker, LinkerStats, ReferenceLookup, WikipediaLookup};
use crate::links::{extract_links, Link, LinkFetchResult, LinkFetcher};
use crate::output::{CanonicalDocument, ConversionOutput, ConversionStats};
use crate::pipeline::canonical::canonicalize;
use crate::pipeline::extract::{Extractor, ExtractorRegistry};
use crate::pipeline::input::{self, RawInput};
use crate::pipeline::sniff::{self, FormatTag};
use crate::retry::{Sleeper, TokioSleeper};
use crate::store::{ArtifactRecord, ArtifactStore, FsBackend, StorageBackend};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A conversion plus the artifact record it was stored under.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutput {
    pub output: ConversionOutput,
    pub record: ArtifactRecord,
}

/// An explicit conversion context.
pub struct Pipeline {
    config: PipelineConfig,
    registry: ExtractorRegistry,
    cache: ConversionCache,
    linker: Option<ConceptLinker>,
    fetcher: LinkFetcher,
    store: Option<ArtifactStore>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("linker", &self.linker)
            .field("fetcher", &self.fetcher)
            .field("store", &self.store)
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline from config alone.
    pub fn new(config: PipelineConfig) -> Result<Self, DocError> {
        Self::builder(config).build()
    }

    /// Start a builder for injecting collaborators.
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            lookup: None,
            sleeper: None,
            backend: None,
            extractors: Vec::new(),
            aliases: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ConversionCache {
        &self.cache
    }

    pub fn linker(&self) -> Option<&ConceptLinker> {
        self.linker.as_ref()
    }

    pub fn sniff(&self, input: &RawInput) -> FormatTag {
        sniff::sniff(input)
    }

    /// Sniff, extract, canonicalize (cached), link.
    pub async fn convert(&self, input: RawInput) -> Result<ConversionOutput, DocError> {
        let format = self.sniff(&input);
        debug!("Sniffed '{}' as {}", input.display_name(), format);
        self.convert_as(input, format).await
    }

    /// Convert with an explicit format, skipping sniffing.
    pub async fn convert_as(&self, input: RawInput, format: FormatTag) -> Result<ConversionOutput, DocError> {
        let total_start = Instant::now();
        let name = input.display_name().to_string();
        info!("Converting '{}' ({} bytes) as {}", name, input.len(), format);

        let extractor = self.registry.get(format).ok_or_else(|| DocError::UnknownFormat {
            name: name.clone(),
            mime: input.mime().map(String::from),
        })?;

        // ── Extract + canonicalize, single-flight per key ────────────────
        let convert_start = Instant::now();
        let key = CacheKey::new(input.content_hash(), &extractor);
        let lookup = self
            .cache
            .get_or_compute(key, move || {
                let intermediate = extractor.extract(&input)?;
                canonicalize(&intermediate)
            })
            .await?;
        let convert_duration_ms = convert_start.elapsed().as_millis() as u64;
        debug!(
            "Canonical document for '{}' from {:?} in {}ms",
            name, lookup.source, convert_duration_ms
        );

        // ── Link ─────────────────────────────────────────────────────────
        let link_start = Instant::now();
        let mentions = match &self.linker {
            Some(linker) => linker.link(&lookup.document).await,
            None => Vec::new(),
        };
        let links = extract_links(&lookup.document.markdown);
        let link_duration_ms = link_start.elapsed().as_millis() as u64;

        let mut stats = ConversionStats {
            convert_duration_ms,
            link_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            ..ConversionStats::default()
        };
        stats.count_mentions(&mentions);

        info!(
            "Converted '{}': {} bytes of markdown, {} mentions ({} resolved), {}ms total",
            name,
            lookup.document.markdown.len(),
            stats.mentions_total,
            stats.mentions_resolved,
            stats.total_duration_ms
        );

        Ok(ConversionOutput {
            document: lookup.document,
            format,
            cache: lookup.source,
            mentions,
            links,
            stats,
        })
    }

    /// Resolve a local path or HTTP(S) URL, then convert.
    pub async fn convert_path(&self, path_or_url: &str) -> Result<ConversionOutput, DocError> {
        let input = input::resolve_input(
            path_or_url,
            self.config.download_timeout_secs,
            &self.config.user_agent,
        )
        .await?;
        self.convert(input).await
    }

    /// Convert and write the Markdown to `output_path` atomically.
    pub async fn convert_to_file(
        &self,
        path_or_url: &str,
        output_path: impl AsRef<Path>,
    ) -> Result<ConversionOutput, DocError> {
        let output = self.convert_path(path_or_url).await?;
        let path = output_path.as_ref().to_path_buf();
        let markdown = output.document.markdown.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &markdown))
            .await
            .map_err(|e| DocError::Internal(format!("writer task failed: {e}")))?
            .map_err(|e| DocError::OutputWriteFailed {
                path,
                detail: e.to_string(),
            })?;
        Ok(output)
    }

    /// Persist a canonical document as the newest version of `logical_id`.
    pub async fn store(&self, doc: &CanonicalDocument, logical_id: &str) -> Result<ArtifactRecord, DocError> {
        Ok(self.artifact_store()?.store(doc, logical_id).await?)
    }

    /// Latest stored record for `logical_id`.
    pub async fn fetch(&self, logical_id: &str) -> Result<Option<ArtifactRecord>, DocError> {
        Ok(self.artifact_store()?.fetch(logical_id).await?)
    }

    /// Convert then store. A storage failure leaves the conversion cached,
    /// so retrying only repeats the store.
    pub async fn ingest(&self, input: RawInput, logical_id: &str) -> Result<IngestOutput, DocError> {
        let output = self.convert(input).await?;
        let record = self.store(&output.document, logical_id).await?;
        Ok(IngestOutput { output, record })
    }

    /// Convert many inputs with bounded concurrency. Results come back in
    /// input order; one failure does not stop the others.
    pub async fn convert_batch(&self, inputs: Vec<RawInput>) -> Vec<Result<ConversionOutput, DocError>> {
        let total = inputs.len();
        let callback = self.config.progress_callback.clone();
        if let Some(cb) = &callback {
            cb.on_batch_start(total);
        }

        let mut results: Vec<(usize, Result<ConversionOutput, DocError>)> =
            stream::iter(inputs.into_iter().enumerate().map(|(index, input)| {
                let callback = callback.clone();
                async move {
                    if let Some(cb) = &callback {
                        cb.on_document_start(index, total, input.display_name());
                    }
                    let result = self.convert(input).await;
                    if let Some(cb) = &callback {
                        match &result {
                            Ok(out) => cb.on_document_complete(index, total, out.markdown().len()),
                            Err(e) => cb.on_document_error(index, total, &e.to_string()),
                        }
                    }
                    (index, result)
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let succeeded = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!("Batch complete: {}/{} documents converted", succeeded, total);
        if let Some(cb) = &callback {
            cb.on_batch_complete(total, succeeded);
        }
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Write the alias table to `alias_path`. Returns false when there is
    /// nothing to save to.
    pub fn save_aliases(&self) -> Result<bool, DocError> {
        match (&self.linker, &self.config.alias_path) {
            (Some(linker), Some(path)) => {
                linker.aliases().save(path)?;
                debug!("Saved {} aliases to {}", linker.aliases().len(), path.display());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Fetch title and description of each outbound link, e.g. the
    /// [`ConversionOutput::links`] of a conversion. Never fails; per-URL
    /// failures are collected in [`LinkFetchResult::errors`].
    pub async fn fetch_links(&self, links: &[Link]) -> LinkFetchResult {
        self.fetcher.fetch_all(links).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn linker_stats(&self) -> Option<LinkerStats> {
        self.linker.as_ref().map(ConceptLinker::stats)
    }

    fn artifact_store(&self) -> Result<&ArtifactStore, DocError> {
        self.store
            .as_ref()
            .ok_or_else(|| DocError::InvalidConfig("no artifact store configured (set store_dir)".into()))
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Builder for [`Pipeline`] with injectable collaborators.
pub struct PipelineBuilder {
    config: PipelineConfig,
    lookup: Option<Arc<dyn ReferenceLookup>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    backend: Option<Arc<dyn StorageBackend>>,
    extractors: Vec<Extractor>,
    aliases: Option<Arc<AliasTable>>,
}

impl PipelineBuilder {
    /// Reference lookup for the linker. Injecting one enables linking.
    pub fn lookup(mut self, lookup: Arc<dyn ReferenceLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Clock used between retries of lookups, link fetches and store operations.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Artifact backend, taking precedence over `store_dir`.
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the registered extractor for that extractor's format.
    pub fn extractor(mut self, extractor: Extractor) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Share an alias table instead of loading one from `alias_path`.
    pub fn aliases(mut self, aliases: Arc<AliasTable>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn build(self) -> Result<Pipeline, DocError> {
        let config = self.config;

        let mut registry = ExtractorRegistry::default();
        for extractor in self.extractors {
            registry.register(extractor);
        }

        let durable = config.cache_dir.as_ref().map(DurableTier::new);
        let cache = ConversionCache::new(config.cache_capacity, durable);
        for extractor in registry.extractors() {
            match cache.invalidate_superseded(extractor) {
                Ok(0) => {}
                Ok(n) => info!("Removed {} superseded cache version(s) of {}", n, extractor.id()),
                Err(e) => warn!("Could not prune superseded cache entries of {}: {}", extractor.id(), e),
            }
        }

        let sleeper: Arc<dyn Sleeper> = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        let lookup = match self.lookup {
            Some(l) => Some(l),
            None if config.link_concepts => Some(Arc::new(WikipediaLookup::new(
                config.lookup_endpoint.clone(),
                config.max_candidates,
                &config.user_agent,
            )?) as Arc<dyn ReferenceLookup>),
            None => None,
        };
        let linker = match lookup {
            Some(lookup) => {
                let aliases = match self.aliases {
                    Some(a) => a,
                    None => Arc::new(match &config.alias_path {
                        Some(path) => AliasTable::load(path)?,
                        None => AliasTable::new(),
                    }),
                };
                info!(
                    "Concept linking via {} ({} known aliases)",
                    lookup.name(),
                    aliases.len()
                );
                Some(ConceptLinker::new(
                    lookup,
                    aliases,
                    Arc::clone(&sleeper),
                    config.linker_config(),
                ))
            }
            None => None,
        };

        let fetcher = LinkFetcher::new(&config.user_agent, config.fetch_config(), Arc::clone(&sleeper))?;

        let backend = match self.backend {
            Some(b) => Some(b),
            None => config
                .store_dir
                .as_ref()
                .map(|dir| Arc::new(FsBackend::new(dir)) as Arc<dyn StorageBackend>),
        };
        let store = backend.map(|b| ArtifactStore::new(b, config.store_retry.clone(), Arc::clone(&sleeper)));

        Ok(Pipeline {
            config,
            registry,
            cache,
            linker,
            fetcher,
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSource;
    use crate::pipeline::extract::ExtractorKind;
    use crate::store::MemoryBackend;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn converts_html_without_linking() {
        let p = pipeline();
        let input = RawInput::from_bytes(
            b"<html><body><h1>Intro</h1><p>Hello <b>World</b> <a href=\"https://example.com\">site</a></p></body></html>"
                .to_vec(),
            "page.html",
        );
        let out = p.convert(input).await.unwrap();
        assert_eq!(out.format, FormatTag::Html);
        assert_eq!(out.cache, CacheSource::Computed);
        assert!(out.markdown().starts_with("# Intro\n\nHello **World**"));
        assert!(out.mentions.is_empty());
        assert_eq!(out.links.len(), 1);
        assert!(p.linker_stats().is_none());
    }

    #[tokio::test]
    async fn second_conversion_hits_memory() {
        let p = pipeline();
        let input = RawInput::from_bytes(b"# Title\n\nBody text.\n".to_vec(), "a.md");
        let first = p.convert(input.clone()).await.unwrap();
        let second = p.convert(input).await.unwrap();
        assert_eq!(second.cache, CacheSource::Memory);
        assert!(Arc::ptr_eq(&first.document, &second.document));
        assert_eq!(p.cache_stats().computations, 1);
    }

    #[tokio::test]
    async fn unknown_bytes_fail_at_sniff_stage() {
        let p = pipeline();
        let err = p
            .convert(RawInput::from_bytes(vec![0u8, 159, 146, 150, 0, 1], "blob.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::UnknownFormat { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn forced_format_changes_the_cache_key() {
        let p = pipeline();
        let input = RawInput::from_bytes(b"# Not a heading in plain text\n".to_vec(), "x.md");
        let md = p.convert_as(input.clone(), FormatTag::Markdown).await.unwrap();
        let txt = p.convert_as(input, FormatTag::PlainText).await.unwrap();
        assert_eq!(md.cache, CacheSource::Computed);
        assert_eq!(txt.cache, CacheSource::Computed);
        assert_ne!(md.document.metadata.extractor_id, txt.document.metadata.extractor_id);
    }

    #[tokio::test]
    async fn injected_extractor_version_is_used() {
        let p = Pipeline::builder(PipelineConfig::default())
            .extractor(Extractor::new(ExtractorKind::PlainText).with_version(9))
            .build()
            .unwrap();
        let out = p
            .convert_as(RawInput::from_bytes(b"hello".to_vec(), "a.txt"), FormatTag::PlainText)
            .await
            .unwrap();
        assert_eq!(out.document.metadata.extractor_version, 9);
    }

    #[tokio::test]
    async fn store_without_backend_is_a_config_error() {
        let p = pipeline();
        let out = p
            .convert(RawInput::from_bytes(b"hello".to_vec(), "a.txt"))
            .await
            .unwrap();
        let err = p.store(&out.document, "a").await.unwrap_err();
        assert!(matches!(err, DocError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn ingest_stores_latest_version() {
        let backend = Arc::new(MemoryBackend::new());
        let p = Pipeline::builder(PipelineConfig::default())
            .backend(backend.clone())
            .build()
            .unwrap();
        p.ingest(RawInput::from_bytes(b"first".to_vec(), "a.txt"), "doc")
            .await
            .unwrap();
        let second = p
            .ingest(RawInput::from_bytes(b"second".to_vec(), "a.txt"), "doc")
            .await
            .unwrap();
        let latest = p.fetch("doc").await.unwrap().unwrap();
        assert_eq!(latest, second.record);
        assert_eq!(backend.blob_count(), 2);
    }

    #[tokio::test]
    async fn batch_keeps_input_order_and_isolates_failures() {
        let p = pipeline();
        let inputs = vec![
            RawInput::from_bytes(b"one".to_vec(), "1.txt"),
            RawInput::from_bytes(vec![0u8, 255, 0, 255], "2.bin"),
            RawInput::from_bytes(b"three".to_vec(), "3.txt"),
        ];
        let results = p.convert_batch(inputs).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().markdown(), "one\n");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().markdown(), "three\n");
    }

    #[tokio::test]
    async fn convert_to_file_writes_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.md");
        std::fs::write(&src, "# Hi\n").unwrap();
        let dest = dir.path().join("out/result.md");
        let p = pipeline();
        p.convert_to_file(src.to_str().unwrap(), &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "# Hi\n");
    }

    #[test]
    fn save_aliases_without_path_is_a_no_op() {
        assert!(!pipeline().save_aliases().unwrap());
    }
}
