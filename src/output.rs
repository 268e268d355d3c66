//! Output types returned by the conversion API.

use crate::cache::CacheSource;
use crate::linker::{ConceptMention, MentionState};
use crate::links::Link;
use crate::pipeline::sniff::FormatTag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A document rendered into the canonical Markdown dialect.
///
/// `markdown` is a pure function of the extracted structure and the dialect
/// revision, so `content_hash` is stable across runs and machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub markdown: String,
    /// Lowercase hex SHA-256 of `markdown`.
    pub content_hash: String,
    pub metadata: CanonicalMetadata,
}

/// Where a canonical document came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadata {
    pub source_format: FormatTag,
    pub extractor_id: String,
    pub extractor_version: u32,
    /// Revision of the Markdown dialect the document was rendered with.
    pub dialect_version: u32,
    /// SHA-256 of the raw input bytes.
    pub source_hash: String,
    pub title: Option<String>,
    /// Informational only; not part of `content_hash`.
    pub converted_at: DateTime<Utc>,
}

/// Result of converting a single input.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    pub document: Arc<CanonicalDocument>,
    /// Format the input was extracted as.
    pub format: FormatTag,
    /// Which cache tier served the canonical document.
    pub cache: CacheSource,
    /// Concept mentions in document order. Empty when linking is disabled.
    pub mentions: Vec<ConceptMention>,
    /// Absolute outbound links, deduplicated, first-seen order.
    pub links: Vec<Link>,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    pub fn markdown(&self) -> &str {
        &self.document.markdown
    }
}

/// Timing and linking counters for one conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionStats {
    /// Sniffing, extraction and canonicalization (zero-ish on a cache hit).
    pub convert_duration_ms: u64,
    pub link_duration_ms: u64,
    pub total_duration_ms: u64,
    pub mentions_total: usize,
    pub mentions_resolved: usize,
    pub mentions_unresolved: usize,
    pub mentions_rejected: usize,
}

impl ConversionStats {
    /// Fill the mention counters from a linker result.
    pub(crate) fn count_mentions(&mut self, mentions: &[ConceptMention]) {
        self.mentions_total = mentions.len();
        self.mentions_resolved = 0;
        self.mentions_unresolved = 0;
        self.mentions_rejected = 0;
        for m in mentions {
            match m.state {
                MentionState::Resolved { .. } => self.mentions_resolved += 1,
                MentionState::Unresolved { .. } => self.mentions_unresolved += 1,
                MentionState::Rejected { .. } => self.mentions_rejected += 1,
            }
        }
    }
}
