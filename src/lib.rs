//! # docmark
//!
//! Normalise PDF, DOCX, HTML, Markdown and plain text into one canonical,
//! diffable Markdown dialect, and optionally link concept mentions to
//! encyclopedia entries.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes / path / URL
//!  │
//!  ├─ 1. Sniff      magic bytes, hints, structure → FormatTag
//!  ├─ 2. Extract    pdf-extract / zip+quick-xml / scraper / pulldown-cmark
//!  ├─ 3. Canonical  one dialect, deterministic, content-hashed
//!  ├─ 4. Cache      single-flight, memory LRU + optional durable tier
//!  ├─ 5. Link       best-effort concept mentions (alias table, lookup, fuzzy)
//!  └─ 6. Store      content-addressed blobs + append-only records
//! ```
//!
//! Identical bytes under the same extractor and dialect version always
//! produce byte-identical Markdown, so the canonical output can be diffed,
//! hashed and cached.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docmark::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().link_concepts(true).build()?;
//!     let pipeline = Pipeline::new(config)?;
//!     let output = pipeline.convert_path("report.docx").await?;
//!     println!("{}", output.markdown());
//!     eprintln!(
//!         "{} mentions, {} resolved",
//!         output.stats.mentions_total, output.stats.mentions_resolved
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docmark` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docmark = { version = "0.1", default-features = false }
//! ```
//!
//! ## Fidelity
//!
//! | Format | Structure recovered |
//! |--------|---------------------|
//! | HTML, Markdown | full block and inline structure |
//! | DOCX | headings, lists, bold/italic, links, tables, line breaks |
//! | PDF | paragraphs and bullets in flattened reading order |
//! | Plain text | paragraphs |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod linker;
pub mod links;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheKey, CacheSource, CacheStats, ConversionCache};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use convert::{IngestOutput, Pipeline, PipelineBuilder};
pub use error::{DocError, FetchError, LookupError, Stage, StorageError};
pub use linker::{
    AliasEntry, AliasTable, ConceptLinker, ConceptMention, LinkerConfig, LinkerStats, MentionState,
    ReferenceCandidate, ReferenceLookup, RejectReason, WikipediaLookup,
};
pub use links::{extract_links, FetchConfig, Link, LinkError, LinkFetchResult, LinkFetcher, LinkMetadata};
pub use output::{CanonicalDocument, CanonicalMetadata, ConversionOutput, ConversionStats};
pub use pipeline::canonical::{canonicalize, DIALECT_VERSION};
pub use pipeline::extract::{Extractor, ExtractorKind, ExtractorRegistry};
pub use pipeline::input::RawInput;
pub use pipeline::sniff::{sniff, FormatTag};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use store::{ArtifactRecord, ArtifactStore, FsBackend, MemoryBackend, StorageBackend};
pub use stream::{convert_stream, DocumentResult, DocumentStream};
