//! Canonicalization: render an [`IntermediateDocument`] into the canonical
//! Markdown dialect.
//!
//! The output is a pure function of the block tree. Two documents with equal
//! trees render to byte-identical Markdown whatever format they came from,
//! which is what makes content-addressed caching and cross-ingest diffs work.
//!
//! ## Dialect (revision [`DIALECT_VERSION`])
//!
//! - Headings: distinct source levels are dense-ranked from `#`, capped at 6
//! - Emphasis: `**bold**`, `*italic*`; whitespace at run edges sits outside
//!   the markers and equal-format neighbours merge. Punctuation at a marker
//!   that touches a word moves outside the run so the marker stays flanking
//! - Escapes: backslash, `*`, backtick, brackets, boundary `_`, `<` and
//!   entity-like `&`
//! - Inline code: backtick fence one longer than the longest run inside
//! - Links `[text](url)`, images `![alt](src)`; destinations with spaces or
//!   parentheses are wrapped in `<>`
//! - Hard breaks: backslash + newline
//! - Code blocks: fenced with at least three backticks, contents verbatim
//! - Lists: `- ` and `1.`…`n.`, continuation indented to the marker width
//! - Blockquotes `> `, rules `---`, GFM pipe tables
//! - One blank line between blocks, one trailing newline

use crate::error::DocError;
use crate::output::{CanonicalDocument, CanonicalMetadata};
use crate::pipeline::document::{Block, BlockKind, Inline, IntermediateDocument};
use crate::pipeline::input::sha256_hex;
use crate::pipeline::postprocess;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Revision of the Markdown dialect. Part of every cache key.
pub const DIALECT_VERSION: u32 = 2;

/// Deepest block or inline nesting accepted.
pub const MAX_NESTING: usize = 64;

static RE_ORDERED_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([.)])").unwrap());
static RE_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(?:#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});").unwrap()
});

/// Render `doc` into a [`CanonicalDocument`].
pub fn canonicalize(doc: &IntermediateDocument) -> Result<CanonicalDocument, DocError> {
    let markdown = render_markdown(doc)?;
    let content_hash = sha256_hex(markdown.as_bytes());
    let title = doc
        .title
        .as_deref()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .or_else(|| doc.first_heading());

    Ok(CanonicalDocument {
        markdown,
        content_hash,
        metadata: CanonicalMetadata {
            source_format: doc.source.format,
            extractor_id: doc.source.extractor_id.clone(),
            extractor_version: doc.source.extractor_version,
            dialect_version: DIALECT_VERSION,
            source_hash: doc.source.source_hash.clone(),
            title,
            converted_at: Utc::now(),
        },
    })
}

/// The Markdown body alone, without metadata.
pub fn render_markdown(doc: &IntermediateDocument) -> Result<String, DocError> {
    let fail = |detail: String| DocError::Canonicalization {
        extractor: format!(
            "{}@{}",
            doc.source.extractor_id, doc.source.extractor_version
        ),
        detail,
    };

    let mut levels = BTreeSet::new();
    collect_heading_levels(&doc.blocks, 0, &mut levels).map_err(fail)?;
    let mut ranks = [0u8; 7];
    for (rank, level) in levels.iter().enumerate() {
        ranks[*level as usize] = (rank as u8 + 1).min(6);
    }

    let renderer = Renderer { ranks };
    let blocks = renderer.blocks(&doc.blocks, 0).map_err(fail)?;
    Ok(postprocess::clean_markdown(&blocks.join("\n\n")))
}

fn collect_heading_levels(
    blocks: &[Block],
    depth: usize,
    levels: &mut BTreeSet<u8>,
) -> Result<(), String> {
    if depth > MAX_NESTING {
        return Err(format!("block nesting exceeds {MAX_NESTING} levels"));
    }
    for block in blocks {
        match &block.kind {
            BlockKind::Heading { level, .. } => {
                if !(1..=6).contains(level) {
                    return Err(format!("heading level {level} outside 1..=6"));
                }
                levels.insert(*level);
            }
            BlockKind::Quote(inner) => collect_heading_levels(inner, depth + 1, levels)?,
            BlockKind::List { items, .. } => {
                for item in items {
                    collect_heading_levels(&item.blocks, depth + 1, levels)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

struct Renderer {
    /// Source heading level → output level.
    ranks: [u8; 7],
}

impl Renderer {
    fn blocks(&self, blocks: &[Block], depth: usize) -> Result<Vec<String>, String> {
        let mut out = Vec::with_capacity(blocks.len());
        for block in blocks {
            if let Some(rendered) = self.block(block, depth)? {
                out.push(rendered);
            }
        }
        Ok(out)
    }

    fn block(&self, block: &Block, depth: usize) -> Result<Option<String>, String> {
        if depth > MAX_NESTING {
            return Err(format!("block nesting exceeds {MAX_NESTING} levels"));
        }
        let rendered = match &block.kind {
            BlockKind::Heading { level, content } => {
                let text = escape_closing_hashes(inline(content, true, depth)?);
                if text.is_empty() {
                    return Ok(None);
                }
                let rank = self.ranks[usize::from(*level)].max(1);
                format!("{} {}", "#".repeat(usize::from(rank)), text)
            }
            BlockKind::Paragraph(content) => escape_line_starts(&inline(content, false, depth)?),
            BlockKind::List { ordered, items } => {
                let mut lines = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    let marker = if *ordered {
                        format!("{}. ", i + 1)
                    } else {
                        "- ".to_string()
                    };
                    let body = self.blocks(&item.blocks, depth + 1)?.join("\n\n");
                    lines.push(indent_item(&marker, &body));
                }
                lines.join("\n")
            }
            BlockKind::Table { rows } => table(rows, depth)?,
            BlockKind::Image { alt, src } => image(alt, src),
            BlockKind::CodeBlock { language, code } => code_block(language.as_deref(), code),
            BlockKind::Quote(inner) => {
                let body = self.blocks(inner, depth + 1)?.join("\n\n");
                body.split('\n')
                    .filter(|_| !body.is_empty())
                    .map(|l| if l.is_empty() { ">".to_string() } else { format!("> {l}") })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            BlockKind::Rule => "---".to_string(),
        };
        Ok((!rendered.is_empty()).then_some(rendered))
    }
}

fn indent_item(marker: &str, body: &str) -> String {
    let pad = " ".repeat(marker.len());
    let mut out = String::new();
    for (i, line) in body.split('\n').enumerate() {
        if i == 0 {
            out.push_str(marker.trim_end());
            if !line.is_empty() {
                out.push(' ');
                out.push_str(line);
            }
        } else {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&pad);
                out.push_str(line);
            }
        }
    }
    out
}

fn table(rows: &[Vec<Vec<Inline>>], depth: usize) -> Result<String, String> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return Ok(String::new());
    }
    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (i, row) in rows.iter().enumerate() {
        let mut cells = Vec::with_capacity(width);
        for cell in row {
            cells.push(inline(cell, true, depth)?.replace('|', "\\|"));
        }
        cells.resize(width, String::new());
        lines.push(format!("| {} |", cells.join(" | ")));
        if i == 0 {
            lines.push(format!("|{}", " --- |".repeat(width)));
        }
    }
    Ok(lines.join("\n"))
}

fn code_block(language: Option<&str>, code: &str) -> String {
    let code = code.trim_end_matches('\n');
    let fence = "`".repeat((longest_run(code, '`') + 1).max(3));
    let info = language
        .and_then(|l| l.split_whitespace().next())
        .filter(|l| !l.contains('`'))
        .unwrap_or("");
    if code.is_empty() {
        format!("{fence}{info}\n{fence}")
    } else {
        format!("{fence}{info}\n{code}\n{fence}")
    }
}

fn longest_run(s: &str, ch: char) -> usize {
    let mut best = 0;
    let mut run = 0;
    for c in s.chars() {
        if c == ch {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

// ── Inline rendering ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Style {
    bold: bool,
    italic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Bold,
    Italic,
}

impl Marker {
    fn as_str(self) -> &'static str {
        match self {
            Marker::Bold => "**",
            Marker::Italic => "*",
        }
    }

    fn wanted(self, style: Style) -> bool {
        match self {
            Marker::Bold => style.bold,
            Marker::Italic => style.italic,
        }
    }
}

/// Inline content flattened to styled atoms with explicit spaces.
#[derive(Debug)]
enum Token {
    Word(String, Style),
    Code(String, Style),
    Link {
        content: Vec<Token>,
        url: String,
        style: Style,
    },
    Image {
        alt: String,
        src: String,
        style: Style,
    },
    Space,
    Break,
}

fn tokenize(
    inlines: &[Inline],
    style: Style,
    in_link: bool,
    depth: usize,
    out: &mut Vec<Token>,
) -> Result<(), String> {
    if depth > MAX_NESTING {
        return Err(format!("inline nesting exceeds {MAX_NESTING} levels"));
    }
    for inline in inlines {
        match inline {
            Inline::Text(text) => push_words(text, style, out),
            Inline::Bold(inner) => tokenize(
                inner,
                Style {
                    bold: true,
                    ..style
                },
                in_link,
                depth + 1,
                out,
            )?,
            Inline::Italic(inner) => tokenize(
                inner,
                Style {
                    italic: true,
                    ..style
                },
                in_link,
                depth + 1,
                out,
            )?,
            Inline::Code(code) => out.push(Token::Code(code.clone(), style)),
            Inline::Link { content, .. } if in_link => {
                tokenize(content, style, true, depth + 1, out)?
            }
            Inline::Link { content, url } => {
                let mut inner = Vec::new();
                tokenize(content, Style::default(), true, depth + 1, &mut inner)?;
                keep_markers_flanking(&mut inner, true);
                out.push(Token::Link {
                    content: inner,
                    url: url.clone(),
                    style,
                });
            }
            Inline::Image { alt, src } => out.push(Token::Image {
                alt: alt.clone(),
                src: src.clone(),
                style,
            }),
            Inline::LineBreak => out.push(Token::Break),
        }
    }
    Ok(())
}

fn push_words(text: &str, style: Style, out: &mut Vec<Token>) {
    let mut word = String::new();
    for c in text.chars() {
        if postprocess::INVISIBLE.contains(&c) {
            continue;
        }
        if c.is_whitespace() {
            if !word.is_empty() {
                out.push(Token::Word(std::mem::take(&mut word), style));
            }
            out.push(Token::Space);
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        out.push(Token::Word(word, style));
    }
}

/// Render inline content. `single_line` turns hard breaks into spaces.
fn inline(content: &[Inline], single_line: bool, depth: usize) -> Result<String, String> {
    let mut tokens = Vec::new();
    tokenize(content, Style::default(), false, depth, &mut tokens)?;
    keep_markers_flanking(&mut tokens, single_line);
    Ok(render_tokens(&tokens, single_line))
}

fn render_tokens(tokens: &[Token], single_line: bool) -> String {
    let mut out = String::new();
    let mut open: Vec<Marker> = Vec::new();
    let mut pending_space = false;
    let mut line_has_content = false;

    for token in tokens {
        let (piece, style) = match token {
            Token::Space => {
                pending_space = line_has_content;
                continue;
            }
            Token::Break if single_line => {
                pending_space = line_has_content;
                continue;
            }
            Token::Break => {
                close_from(&mut open, 0, &mut out);
                if line_has_content {
                    out.push_str("\\\n");
                    line_has_content = false;
                }
                pending_space = false;
                continue;
            }
            Token::Word(word, style) => (escape_text(word), *style),
            Token::Code(code, style) => (code_span(code), *style),
            Token::Link {
                content,
                url,
                style,
            } => (link(content, url), *style),
            Token::Image { alt, src, style } => (image(alt, src), *style),
        };
        if piece.is_empty() {
            continue;
        }

        // Close first so markers hug the previous word, then the space, then open.
        if let Some(i) = open.iter().position(|m| !m.wanted(style)) {
            close_from(&mut open, i, &mut out);
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        for marker in [Marker::Bold, Marker::Italic] {
            if marker.wanted(style) && !open.contains(&marker) {
                out.push_str(marker.as_str());
                open.push(marker);
            }
        }
        out.push_str(&piece);
        line_has_content = true;
    }
    close_from(&mut open, 0, &mut out);
    if !line_has_content && out.ends_with("\\\n") {
        out.truncate(out.len() - 2);
    }
    out
}

fn close_from(open: &mut Vec<Marker>, index: usize, out: &mut String) {
    while open.len() > index {
        if let Some(marker) = open.pop() {
            out.push_str(marker.as_str());
        }
    }
}

impl Token {
    fn style(&self) -> Option<Style> {
        match self {
            Token::Word(_, s) | Token::Code(_, s) => Some(*s),
            Token::Link { style, .. } | Token::Image { style, .. } => Some(*style),
            Token::Space | Token::Break => None,
        }
    }

    fn set_style(&mut self, new: Style) {
        match self {
            Token::Word(_, s) | Token::Code(_, s) => *s = new,
            Token::Link { style, .. } | Token::Image { style, .. } => *style = new,
            Token::Space | Token::Break => {}
        }
    }

    /// The text `render_tokens` emits for this token, without markers.
    fn piece(&self) -> String {
        match self {
            Token::Word(word, _) => escape_text(word),
            Token::Code(code, _) => code_span(code),
            Token::Link { content, url, .. } => link(content, url),
            Token::Image { alt, src, .. } => image(alt, src),
            Token::Space | Token::Break => String::new(),
        }
    }
}

/// Anything that is neither alphanumeric nor whitespace counts as
/// punctuation for delimiter flanking.
fn is_punct(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

/// Marker changes `render_tokens` makes when moving from `open` to `next`:
/// whether it closes any, whether it opens any, and the resulting stack.
fn transition(open: &[Marker], next: Style) -> (bool, bool, Vec<Marker>) {
    let mut stack = open.to_vec();
    let closes = match stack.iter().position(|m| !m.wanted(next)) {
        Some(i) => {
            stack.truncate(i);
            true
        }
        None => false,
    };
    let mut opens = false;
    for marker in [Marker::Bold, Marker::Italic] {
        if marker.wanted(next) && !stack.contains(&marker) {
            stack.push(marker);
            opens = true;
        }
    }
    (closes, opens, stack)
}

/// A marker that would not be read as emphasis where it is placed.
#[derive(Debug, Clone, Copy)]
enum Unflanked {
    /// `tokens[index]` ends in punctuation right before a closing marker
    /// that is followed by a word.
    Closing { index: usize, outer: Style },
    /// `tokens[index]` starts with punctuation right after an opening marker
    /// that is preceded by a word.
    Opening { index: usize, outer: Style },
}

/// Rewrite style changes between touching tokens so every `*` run is
/// flanking on the side that matters.
///
/// A closing run preceded by punctuation and followed by a word does not
/// close, and an opening run followed by punctuation and preceded by a word
/// does not open. The offending punctuation moves to the outer side of the
/// marker (`**foo.**bar` becomes `**foo**.bar`). A token that cannot be
/// split, such as a code span, drops the emphasis instead.
fn keep_markers_flanking(tokens: &mut Vec<Token>, single_line: bool) {
    // Every fix strictly shrinks some token's marker set, so this ends.
    while let Some(fix) = first_unflanked(tokens, single_line) {
        match fix {
            Unflanked::Closing { index, outer } => {
                if let Token::Word(word, inner) = &tokens[index] {
                    let cut = word.trim_end_matches(is_punct).len();
                    if cut > 0 {
                        let (head, tail, inner) = (word[..cut].to_string(), word[cut..].to_string(), *inner);
                        tokens[index] = Token::Word(head, inner);
                        tokens.insert(index + 1, Token::Word(tail, outer));
                        continue;
                    }
                }
                tokens[index].set_style(outer);
            }
            Unflanked::Opening { index, outer } => {
                if let Token::Word(word, inner) = &tokens[index] {
                    let lead = word.len() - word.trim_start_matches(is_punct).len();
                    if lead < word.len() {
                        let (head, rest, inner) = (word[..lead].to_string(), word[lead..].to_string(), *inner);
                        tokens[index] = Token::Word(rest, inner);
                        tokens.insert(index, Token::Word(head, outer));
                        continue;
                    }
                }
                tokens[index].set_style(outer);
            }
        }
    }
}

fn first_unflanked(tokens: &[Token], single_line: bool) -> Option<Unflanked> {
    let mut open: Vec<Marker> = Vec::new();
    // Index and last emitted char of the content token directly before.
    let mut touching: Option<(usize, char)> = None;

    for (index, token) in tokens.iter().enumerate() {
        let style = match token.style() {
            Some(style) => style,
            None => {
                if matches!(token, Token::Break) && !single_line {
                    open.clear();
                }
                touching = None;
                continue;
            }
        };
        let piece = token.piece();
        let (Some(first), Some(last)) = (piece.chars().next(), piece.chars().last()) else {
            continue;
        };
        let (closes, opens, stack) = transition(&open, style);
        if let Some((before, before_last)) = touching {
            if closes && !opens && is_punct(before_last) && first.is_alphanumeric() {
                return Some(Unflanked::Closing {
                    index: before,
                    outer: style,
                });
            }
            if opens && !closes && is_punct(first) && before_last.is_alphanumeric() {
                return Some(Unflanked::Opening {
                    index,
                    outer: tokens[before].style().unwrap_or_default(),
                });
            }
        }
        open = stack;
        touching = Some((index, last));
    }
    None
}

fn escape_text(text: &str) -> String {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &(at, c)) in chars.iter().enumerate() {
        match c {
            '\\' | '*' | '`' | '[' | ']' | '<' => {
                out.push('\\');
                out.push(c);
            }
            '&' if RE_ENTITY.is_match(&text[at..]) => {
                out.push('\\');
                out.push(c);
            }
            '_' => {
                let inner = i > 0
                    && i + 1 < chars.len()
                    && chars[i - 1].1.is_alphanumeric()
                    && chars[i + 1].1.is_alphanumeric();
                if !inner {
                    out.push('\\');
                }
                out.push('_');
            }
            _ => out.push(c),
        }
    }
    out
}

fn code_span(code: &str) -> String {
    let code = code.replace('\n', " ");
    if code.is_empty() {
        return String::new();
    }
    let fence = "`".repeat(longest_run(&code, '`') + 1);
    let pad = code.starts_with('`')
        || code.ends_with('`')
        || (code.starts_with(' ') && code.ends_with(' ') && !code.trim().is_empty());
    if pad {
        format!("{fence} {code} {fence}")
    } else {
        format!("{fence}{code}{fence}")
    }
}

fn destination(url: &str) -> String {
    let url = url.split_whitespace().collect::<Vec<_>>().join(" ");
    if url.contains([' ', '(', ')']) {
        format!("<{}>", url.replace('<', "%3C").replace('>', "%3E"))
    } else {
        url
    }
}

fn link(content: &[Token], url: &str) -> String {
    let text = render_tokens(content, true);
    let url = url.trim();
    match (text.is_empty(), url.is_empty()) {
        (_, true) => text,
        (true, false) => format!("[{}]({})", escape_text(url), destination(url)),
        (false, false) => format!("[{}]({})", text, destination(url)),
    }
}

fn image(alt: &str, src: &str) -> String {
    let src = src.trim();
    if src.is_empty() {
        return String::new();
    }
    let alt = alt.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("![{}]({})", escape_text(&alt), destination(src))
}

/// Escape characters that would start a block construct at line start.
fn escape_line_starts(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            if line.starts_with(['#', '>', '-', '+', '=']) {
                format!("\\{line}")
            } else if let Some(caps) = RE_ORDERED_START.captures(line) {
                format!("{}\\{}", &caps[1], &line[caps[1].len()..])
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A trailing `#` run would be read as a closing sequence.
fn escape_closing_hashes(text: String) -> String {
    if text.ends_with('#') {
        let stem = text.trim_end_matches('#');
        format!("{stem}\\{}", &text[stem.len()..])
    } else {
        text
    }
}
