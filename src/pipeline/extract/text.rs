//! Plain text: blank-line separated paragraphs, nothing else.

use super::{ExtractError, Extracted};
use crate::pipeline::document::{Block, BlockKind, Inline, Provenance};

/// Decode UTF-8 (BOM tolerated) and normalise line endings.
pub(crate) fn decode(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
    Ok(text.replace("\r\n", "\n").replace('\r', "\n"))
}

pub(crate) fn extract(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = decode(bytes)?;
    Ok(Extracted {
        title: None,
        blocks: paragraphs(&text),
    })
}

/// Split on blank lines; each run of non-blank lines is one paragraph.
fn paragraphs(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;
    let mut offset = 0usize;

    for line in text.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(para(std::mem::take(&mut current), start));
            }
        } else {
            if current.is_empty() {
                start = offset;
            } else {
                current.push(' ');
            }
            current.push_str(line.trim());
        }
        offset += line.len() + 1;
    }
    if !current.is_empty() {
        blocks.push(para(current, start));
    }
    blocks
}

fn para(text: String, offset: usize) -> Block {
    Block::at(
        BlockKind::Paragraph(vec![Inline::Text(text)]),
        Provenance::offset(offset),
    )
}
