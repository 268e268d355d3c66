//! Per-format extraction into an [`IntermediateDocument`].
//!
//! The format set is closed, so extractors are a small enum
//! ([`ExtractorKind`]) dispatched through a lookup table
//! ([`ExtractorRegistry`]) rather than trait objects. Every extractor carries
//! a version; the version is part of the conversion cache key, so bumping
//! it makes previously cached output unreachable.
//!
//! | Kind | Id | Library | Structure recovered |
//! |------|----|---------|---------------------|
//! | `Pdf` | `pdf-text` | pdf-extract | paragraphs, bullets, page provenance (flattened reading order) |
//! | `Docx` | `docx-ooxml` | zip + quick-xml | headings, lists, bold/italic, links, tables |
//! | `Html` | `html-dom` | scraper | full block and inline structure |
//! | `Markdown` | `markdown-cmark` | pulldown-cmark | full block and inline structure |
//! | `PlainText` | `plaintext` | none | paragraphs |

pub mod docx;
pub mod html;
pub mod markdown;
pub mod pdf;
pub mod text;

use crate::error::DocError;
use crate::pipeline::document::{IntermediateDocument, SourceInfo};
use crate::pipeline::input::RawInput;
use crate::pipeline::sniff::FormatTag;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Why a format library could not produce a document.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document is password-protected")]
    PasswordProtected,

    #[error("PDF parse error: {0}")]
    Pdf(String),

    #[error("invalid DOCX archive: {0}")]
    Archive(String),

    #[error("malformed XML in {part}: {detail}")]
    Xml { part: String, detail: String },

    #[error("{part} exceeds the {limit}-byte extraction limit")]
    TooLarge { part: String, limit: u64 },

    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
}

/// The closed set of extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
    Pdf,
    Docx,
    Html,
    Markdown,
    PlainText,
}

impl ExtractorKind {
    pub const ALL: [ExtractorKind; 5] = [
        ExtractorKind::Pdf,
        ExtractorKind::Docx,
        ExtractorKind::Html,
        ExtractorKind::Markdown,
        ExtractorKind::PlainText,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ExtractorKind::Pdf => "pdf-text",
            ExtractorKind::Docx => "docx-ooxml",
            ExtractorKind::Html => "html-dom",
            ExtractorKind::Markdown => "markdown-cmark",
            ExtractorKind::PlainText => "plaintext",
        }
    }

    pub fn format(&self) -> FormatTag {
        match self {
            ExtractorKind::Pdf => FormatTag::Pdf,
            ExtractorKind::Docx => FormatTag::Docx,
            ExtractorKind::Html => FormatTag::Html,
            ExtractorKind::Markdown => FormatTag::Markdown,
            ExtractorKind::PlainText => FormatTag::PlainText,
        }
    }

    /// Current revision of each extractor's behaviour.
    pub fn default_version(&self) -> u32 {
        match self {
            ExtractorKind::Pdf => 2,
            ExtractorKind::Docx => 2,
            ExtractorKind::Html => 3,
            ExtractorKind::Markdown => 2,
            ExtractorKind::PlainText => 1,
        }
    }
}

/// An extraction strategy pinned to a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extractor {
    kind: ExtractorKind,
    version: u32,
}

impl Extractor {
    pub fn new(kind: ExtractorKind) -> Self {
        Self {
            kind,
            version: kind.default_version(),
        }
    }

    /// Same strategy under a different version number.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn kind(&self) -> ExtractorKind {
        self.kind
    }

    pub fn id(&self) -> &'static str {
        self.kind.id()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn format(&self) -> FormatTag {
        self.kind.format()
    }

    /// Run the extraction. Synchronous and CPU-bound.
    pub fn extract(&self, input: &RawInput) -> Result<IntermediateDocument, DocError> {
        let start = Instant::now();
        let source = SourceInfo {
            format: self.format(),
            extractor_id: self.id().to_string(),
            extractor_version: self.version,
            source_hash: input.content_hash(),
        };
        let bytes = input.bytes();
        let result = match self.kind {
            ExtractorKind::Pdf => pdf::extract(bytes),
            ExtractorKind::Docx => docx::extract(bytes),
            ExtractorKind::Html => html::extract(bytes),
            ExtractorKind::Markdown => markdown::extract(bytes),
            ExtractorKind::PlainText => text::extract(bytes),
        };
        match result {
            Ok(extracted) => {
                debug!(
                    "{} extracted {} blocks from '{}' in {}ms",
                    self.id(),
                    extracted.blocks.len(),
                    input.display_name(),
                    start.elapsed().as_millis()
                );
                Ok(IntermediateDocument {
                    source,
                    title: extracted.title,
                    blocks: extracted.blocks,
                })
            }
            Err(e) => Err(DocError::Extraction {
                format: self.format(),
                extractor: format!("{}@{}", self.id(), self.version),
                cause: e.to_string(),
            }),
        }
    }
}

/// What a format module returns before source info is attached.
#[derive(Debug, Default)]
pub(crate) struct Extracted {
    pub title: Option<String>,
    pub blocks: Vec<crate::pipeline::document::Block>,
}

/// Lookup table from format to extractor.
#[derive(Debug, Clone)]
pub struct ExtractorRegistry {
    table: HashMap<FormatTag, Extractor>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            table: HashMap::new(),
        };
        for kind in ExtractorKind::ALL {
            registry.register(Extractor::new(kind));
        }
        registry
    }
}

impl ExtractorRegistry {
    /// Install `extractor` for its format, replacing any previous one.
    pub fn register(&mut self, extractor: Extractor) -> &mut Self {
        self.table.insert(extractor.format(), extractor);
        self
    }

    pub fn get(&self, format: FormatTag) -> Option<Extractor> {
        self.table.get(&format).copied()
    }

    pub fn extractors(&self) -> impl Iterator<Item = &Extractor> {
        self.table.values()
    }

    /// Extract `input` as `format`.
    pub fn extract(
        &self,
        input: &RawInput,
        format: FormatTag,
    ) -> Result<IntermediateDocument, DocError> {
        let extractor = self.get(format).ok_or_else(|| DocError::UnknownFormat {
            name: input.display_name().to_string(),
            mime: input.mime().map(String::from),
        })?;
        extractor.extract(input)
    }
}
