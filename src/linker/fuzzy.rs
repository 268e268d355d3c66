//! Candidate scoring: Jaro-Winkler similarity over normalised strings.

use super::lookup::ReferenceCandidate;
use super::terms::normalize;

/// Outcome of scoring a candidate list against a term.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Accepted { index: usize, score: f64 },
    /// The best two candidates are within the ambiguity margin.
    Ambiguous { titles: Vec<String>, score: f64 },
    BelowThreshold { best: String, score: f64 },
    Empty,
}

/// Drop a trailing parenthetical such as `" (band)"`.
pub fn strip_disambiguation(title: &str) -> &str {
    let trimmed = title.trim_end();
    if trimmed.ends_with(')') {
        if let Some(open) = trimmed.rfind(" (") {
            return trimmed[..open].trim_end();
        }
    }
    trimmed
}

/// Similarity in `[0, 1]` between a term and a candidate title.
pub fn similarity(term: &str, title: &str) -> f64 {
    strsim::jaro_winkler(&normalize(term), &normalize(strip_disambiguation(title)))
}

/// Pick the best candidate for `term`.
///
/// The top score must reach `threshold`, and the runner-up must trail it by
/// more than `margin`. Ties keep the service's ordering.
pub fn select(term: &str, candidates: &[ReferenceCandidate], threshold: f64, margin: f64) -> Selection {
    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, similarity(term, &c.title)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let Some(&(top, score)) = scored.first() else {
        return Selection::Empty;
    };
    if score < threshold {
        return Selection::BelowThreshold {
            best: candidates[top].title.clone(),
            score,
        };
    }
    let close: Vec<String> = scored
        .iter()
        .take_while(|(_, s)| score - s <= margin)
        .map(|(i, _)| candidates[*i].title.clone())
        .collect();
    if close.len() > 1 {
        return Selection::Ambiguous { titles: close, score };
    }
    Selection::Accepted { index: top, score }
}
