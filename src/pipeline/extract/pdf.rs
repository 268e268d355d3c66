//! PDF extraction via `pdf-extract`.
//!
//! The text layer comes back in reading order with pages separated by form
//! feeds. From that we recover paragraphs (blank-line separated, wrapped
//! lines rejoined, soft hyphens undone), bullet and numbered lists, and the
//! page each block came from. Fonts and layout are not consulted, so headings
//! are not detected.

use super::{ExtractError, Extracted};
use crate::pipeline::document::{Block, BlockKind, Inline, ListItem, Provenance};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[•◦▪‣∙·\-\*–]\s+(.+)$").unwrap());
static RE_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,3})[\.\)]\s+(.+)$").unwrap());

pub(crate) fn extract(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let encrypted = looks_encrypted(bytes);
    let text = match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => text,
        Ok(Err(_)) if encrypted => return Err(ExtractError::PasswordProtected),
        Ok(Err(e)) => return Err(ExtractError::Pdf(e.to_string())),
        Err(_) if encrypted => return Err(ExtractError::PasswordProtected),
        Err(_) => return Err(ExtractError::Pdf("parser panicked on malformed input".into())),
    };

    let blocks = structure(&text);
    if blocks.is_empty() {
        if encrypted {
            return Err(ExtractError::PasswordProtected);
        }
        warn!("PDF has no extractable text layer (scanned or image-only?)");
    }
    Ok(Extracted {
        title: None,
        blocks,
    })
}

fn looks_encrypted(bytes: &[u8]) -> bool {
    bytes.windows(8).any(|w| w == b"/Encrypt")
}

enum Group {
    Para(String),
    List {
        ordered: bool,
        items: Vec<String>,
    },
}

/// Turn the flattened text layer into blocks with page provenance.
pub(crate) fn structure(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    for (index, page) in text.split('\x0c').enumerate() {
        let page_no = index as u32 + 1;
        let normalised = page.replace("\r\n", "\n").replace('\r', "\n");
        for chunk in normalised.split("\n\n") {
            for group in group_lines(chunk) {
                if let Some(kind) = into_kind(group) {
                    blocks.push(Block::at(kind, Provenance::page(page_no)));
                }
            }
        }
    }
    blocks
}

fn group_lines(chunk: &str) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for raw in chunk.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (marker, body) = if let Some(c) = RE_BULLET.captures(line) {
            (Some(false), c[1].to_string())
        } else if let Some(c) = RE_NUMBERED.captures(line) {
            (Some(true), c[2].to_string())
        } else {
            (None, line.to_string())
        };

        match (marker, groups.last_mut()) {
            (Some(ordered), Some(Group::List { ordered: o, items })) if *o == ordered => {
                items.push(body)
            }
            (Some(ordered), _) => groups.push(Group::List {
                ordered,
                items: vec![body],
            }),
            (None, Some(Group::List { items, .. })) => {
                if let Some(last) = items.last_mut() {
                    join_wrapped(last, &body);
                }
            }
            (None, Some(Group::Para(text))) => join_wrapped(text, &body),
            (None, None) => groups.push(Group::Para(body)),
        }
    }
    groups
}

/// Append a wrapped line, undoing end-of-line hyphenation.
fn join_wrapped(text: &mut String, next: &str) {
    let hyphenated = text.ends_with('-')
        && text[..text.len() - 1]
            .chars()
            .last()
            .is_some_and(char::is_alphabetic)
        && next.chars().next().is_some_and(char::is_lowercase);
    if hyphenated {
        text.pop();
    } else if !text.is_empty() {
        text.push(' ');
    }
    text.push_str(next);
}

fn into_kind(group: Group) -> Option<BlockKind> {
    match group {
        Group::Para(text) if text.trim().is_empty() => None,
        Group::Para(text) => Some(BlockKind::Paragraph(vec![Inline::Text(text)])),
        Group::List { ordered, items } => Some(BlockKind::List {
            ordered,
            items: items
                .into_iter()
                .map(|t| ListItem {
                    blocks: vec![Block::paragraph(t)],
                })
                .collect(),
        }),
    }
}
