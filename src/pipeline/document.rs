//! Intermediate document tree shared by every extractor.
//!
//! Extractors produce this; the canonicalizer consumes it. Nothing else
//! holds on to it.

use crate::pipeline::sniff::FormatTag;
use serde::{Deserialize, Serialize};

/// Which extractor produced a document, from which bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub format: FormatTag,
    pub extractor_id: String,
    pub extractor_version: u32,
    /// SHA-256 of the raw input bytes.
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntermediateDocument {
    pub source: SourceInfo,
    pub title: Option<String>,
    pub blocks: Vec<Block>,
}

impl IntermediateDocument {
    /// Text of the first heading, depth-first.
    pub fn first_heading(&self) -> Option<String> {
        fn find(blocks: &[Block]) -> Option<String> {
            for b in blocks {
                match &b.kind {
                    BlockKind::Heading { content, .. } => {
                        let t = plain_text(content);
                        if !t.is_empty() {
                            return Some(t);
                        }
                    }
                    BlockKind::Quote(inner) => {
                        if let Some(t) = find(inner) {
                            return Some(t);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        find(&self.blocks)
    }
}

/// Where a block came from in the source, when the extractor knows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Provenance {
    /// 1-indexed page number (paged formats).
    pub page: Option<u32>,
    /// Byte offset into the source text (text formats).
    pub offset: Option<usize>,
}

impl Provenance {
    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            offset: None,
        }
    }

    pub fn offset(offset: usize) -> Self {
        Self {
            page: None,
            offset: Some(offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub provenance: Option<Provenance>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            provenance: None,
        }
    }

    pub fn at(kind: BlockKind, provenance: Provenance) -> Self {
        Self {
            kind,
            provenance: Some(provenance),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Paragraph(vec![Inline::Text(text.into())]))
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::new(BlockKind::Heading {
            level,
            content: vec![Inline::Text(text.into())],
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    /// Source heading level, 1..=6. Renumbered by the canonicalizer.
    Heading { level: u8, content: Vec<Inline> },
    Paragraph(Vec<Inline>),
    List { ordered: bool, items: Vec<ListItem> },
    /// Rows of cells; each cell is inline content. The first row is the header.
    Table { rows: Vec<Vec<Vec<Inline>>> },
    Image { alt: String, src: String },
    CodeBlock { language: Option<String>, code: String },
    Quote(Vec<Block>),
    Rule,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListItem {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inline {
    Text(String),
    Bold(Vec<Inline>),
    Italic(Vec<Inline>),
    Code(String),
    Link { content: Vec<Inline>, url: String },
    Image { alt: String, src: String },
    LineBreak,
}

/// Flatten inline content to plain text (no markup).
pub fn plain_text(inlines: &[Inline]) -> String {
    let mut out = String::new();
    push_plain(inlines, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_plain(inlines: &[Inline], out: &mut String) {
    for i in inlines {
        match i {
            Inline::Text(t) | Inline::Code(t) => out.push_str(t),
            Inline::Bold(c) | Inline::Italic(c) | Inline::Link { content: c, .. } => {
                push_plain(c, out)
            }
            Inline::Image { alt, .. } => out.push_str(alt),
            Inline::LineBreak => out.push(' '),
        }
    }
}
