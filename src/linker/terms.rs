//! Candidate concept terms from canonical Markdown.
//!
//! Heuristic noun-phrase detection: runs of capitalised words (or acronyms),
//! optionally joined by lowercase connectors such as "of" or "von". Code,
//! inline code and link destinations are masked out first so identifiers and
//! URLs never become candidates. Spans are byte ranges into the original
//! Markdown.

use crate::pipeline::postprocess::FenceState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

static RE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+(?:['’\-][\p{L}\p{N}]+)*").unwrap());
static RE_LINK_DEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\((?:<[^>\n]*>|[^)\s]*)\)").unwrap());

/// Lowercase words allowed inside a capitalised run.
const CONNECTORS: &[&str] = &["of", "the", "and", "de", "von", "van", "da", "la", "del"];

/// Words that do not start a concept even when capitalised.
const STOPWORDS: &[&str] = &[
    "a", "after", "all", "also", "an", "and", "are", "as", "at", "before", "but", "by", "for",
    "from", "he", "her", "here", "his", "however", "i", "if", "in", "is", "it", "its", "my",
    "no", "not", "of", "on", "or", "our", "she", "so", "some", "that", "the", "their", "then",
    "there", "these", "they", "this", "those", "to", "was", "we", "were", "what", "when",
    "which", "while", "who", "with", "you", "your",
];

/// One occurrence of a candidate term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTerm {
    /// Exact source text.
    pub surface: String,
    pub normalized: String,
    /// Byte range of `surface` in the Markdown.
    pub span: Range<usize>,
}

/// Normalise a term for alias matching and deduplication.
///
/// Lowercases, strips a trailing possessive `'s` and collapses whitespace.
pub fn normalize(term: &str) -> String {
    let lowered = term.replace('’', "'").to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.strip_suffix("'s") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => collapsed,
    }
}

/// All candidate occurrences in document order.
pub fn extract_terms(markdown: &str) -> Vec<CandidateTerm> {
    let masked = mask(markdown);
    let words: Vec<Range<usize>> = RE_WORD.find_iter(&masked).map(|m| m.range()).collect();

    let mut out = Vec::new();
    let mut i = 0;
    while i < words.len() {
        if !is_capitalised(&masked[words[i].clone()]) {
            i += 1;
            continue;
        }
        let start = i;
        let mut last = i;
        let mut j = i + 1;
        while j < words.len() && &masked[words[j - 1].end..words[j].start] == " " {
            let w = &masked[words[j].clone()];
            if is_capitalised(w) {
                last = j;
            } else if !CONNECTORS.contains(&w) {
                break;
            }
            j += 1;
        }
        i = last + 1;

        let mut first = start;
        while first <= last && is_stopword(&masked[words[first].clone()]) {
            first += 1;
        }
        // A run starting with stopwords may now open on a connector.
        while first <= last && !is_capitalised(&masked[words[first].clone()]) {
            first += 1;
        }
        if first > last {
            continue;
        }

        let span = words[first].start..words[last].end;
        let surface = &markdown[span.clone()];
        if first == last && surface.chars().count() < 2 {
            continue;
        }
        out.push(CandidateTerm {
            surface: surface.to_string(),
            normalized: normalize(surface),
            span,
        });
    }
    out
}

fn is_capitalised(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

/// Replace code and link destinations with spaces, keeping byte offsets.
fn mask(markdown: &str) -> String {
    let mut bytes = markdown.as_bytes().to_vec();

    let mut fences = FenceState::default();
    let mut offset = 0;
    for line in markdown.split_inclusive('\n') {
        if fences.is_code(line.trim_end_matches('\n')) {
            blank(&mut bytes, offset..offset + line.len());
        }
        offset += line.len();
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'`' || (i > 0 && bytes[i - 1] == b'\\') {
            i += 1;
            continue;
        }
        let run = count_ticks(&bytes, i);
        match find_closing(&bytes, i + run, run) {
            Some(end) => {
                blank(&mut bytes, i..end);
                i = end;
            }
            None => i += run,
        }
    }

    let partially = String::from_utf8_lossy(&bytes).into_owned();
    let dests: Vec<Range<usize>> = RE_LINK_DEST
        .find_iter(&partially)
        .map(|m| m.start() + 1..m.end())
        .collect();
    for range in dests {
        blank(&mut bytes, range);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn count_ticks(bytes: &[u8], from: usize) -> usize {
    bytes[from..].iter().take_while(|&&b| b == b'`').count()
}

/// End (exclusive) of the first backtick run of exactly `run` ticks at or after `from`.
fn find_closing(bytes: &[u8], from: usize, run: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'`' {
            let n = count_ticks(bytes, i);
            if n == run {
                return Some(i + n);
            }
            i += n;
        } else {
            i += 1;
        }
    }
    None
}

fn blank(bytes: &mut [u8], range: Range<usize>) {
    for b in &mut bytes[range] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}
