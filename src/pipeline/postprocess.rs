//! Post-processing: final textual cleanup of rendered canonical Markdown.
//!
//! The renderer already emits the dialect; these passes catch what leaks in
//! from source text (stray carriage returns, zero-width characters, padding)
//! and pin down block spacing. Every rule is fence-aware: lines inside a
//! fenced code block are passed through untouched, including any fence nested
//! in a blockquote or list item.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so the line-based rules see `\n` only.
//! Blank-line collapsing runs after trimming, so whitespace-only lines count
//! as blank.

/// Apply all post-processing rules to rendered Markdown.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens) outside code
/// 3. Trim trailing whitespace per line outside code
/// 4. Collapse runs of blank lines to a single blank line outside code
/// 5. Ensure the document ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Fence tracking ───────────────────────────────────────────────────────────

/// Tracks whether a line is inside a backtick fence.
#[derive(Default)]
pub(crate) struct FenceState {
    open: Option<usize>,
}

impl FenceState {
    /// Classify `line`; fence delimiter lines count as code.
    pub(crate) fn is_code(&mut self, line: &str) -> bool {
        let body = line.trim_start_matches(['>', ' ']);
        let ticks = body.chars().take_while(|&c| c == '`').count();
        match self.open {
            Some(len) => {
                if ticks >= len && body[ticks..].trim().is_empty() {
                    self.open = None;
                }
                true
            }
            None if ticks >= 3 && !body[ticks..].contains('`') => {
                self.open = Some(ticks);
                true
            }
            None => false,
        }
    }
}

fn map_prose_lines(input: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut fences = FenceState::default();
    input
        .split('\n')
        .map(|line| {
            if fences.is_code(line) {
                line.to_string()
            } else {
                f(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

pub(crate) const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn remove_invisible_chars(input: &str) -> String {
    map_prose_lines(input, |line| line.replace(INVISIBLE, ""))
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    map_prose_lines(input, |line| line.trim_end().to_string())
}

// ── Rule 4: Collapse blank-line runs ─────────────────────────────────────────

fn collapse_blank_lines(input: &str) -> String {
    let mut fences = FenceState::default();
    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in input.split('\n') {
        let code = fences.is_code(line);
        let blank = !code && line.trim().is_empty();
        if blank && (previous_blank || out.is_empty()) {
            continue;
        }
        previous_blank = blank;
        out.push(line);
    }
    out.join("\n")
}

// ── Rule 5: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end_matches(['\n', ' ', '\t']);
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
