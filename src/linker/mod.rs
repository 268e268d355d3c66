//! Best-effort concept linking.
//!
//! ## Flow per document
//!
//! ```text
//! canonical markdown
//!   │
//!   ├─ terms     candidate spans, normalised, deduplicated
//!   ├─ aliases   exact normalised hit → Resolved (confidence 1.0)
//!   ├─ lookup    ReferenceLookup under RetryPolicy + per-attempt timeout
//!   ├─ fuzzy     Jaro-Winkler scoring, threshold + ambiguity margin
//!   └─ mentions  one per occurrence, in document order
//! ```
//!
//! Nothing in here returns an error to the caller. Lookup failures turn into
//! `Unresolved` (transient, retries exhausted) or `Rejected` (permanent)
//! mentions, and the document is delivered regardless.

pub mod alias;
pub mod fuzzy;
pub mod lookup;
pub mod terms;
pub mod wikipedia;

pub use alias::{AliasEntry, AliasTable};
pub use lookup::{ReferenceCandidate, ReferenceLookup};
pub use wikipedia::WikipediaLookup;

use crate::error::LookupError;
use crate::output::CanonicalDocument;
use crate::retry::{self, RetryDecision, RetryPolicy, Sleeper};
use fuzzy::Selection;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Linking state of one mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MentionState {
    /// Transient failures outlasted the retry policy.
    Unresolved {
        attempts: u32,
        last_error: Option<LookupError>,
    },
    Resolved {
        reference_id: String,
        title: String,
        confidence: f64,
    },
    Rejected { reason: RejectReason },
}

impl MentionState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, MentionState::Resolved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    NotFound,
    Ambiguous { candidates: Vec<String> },
    BelowThreshold { best: String, score: f64 },
    Permanent { detail: String },
}

/// A candidate term occurrence and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMention {
    pub surface: String,
    pub normalized: String,
    /// Byte offsets into the canonical markdown.
    pub start: usize,
    pub end: usize,
    pub state: MentionState,
}

impl ConceptMention {
    pub fn span(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Tuning for [`ConceptLinker`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkerConfig {
    pub retry: RetryPolicy,
    /// Minimum fuzzy score to accept a candidate.
    pub acceptance_threshold: f64,
    /// Runner-up within this distance of the top score makes a term ambiguous.
    pub ambiguity_margin: f64,
    /// Distinct terms resolved concurrently per document.
    pub lookup_concurrency: usize,
    /// Distinct terms resolved per document; later ones are ignored.
    pub max_terms: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            acceptance_threshold: 0.88,
            ambiguity_margin: 0.02,
            lookup_concurrency: 4,
            max_terms: 200,
        }
    }
}

/// Counters across every document linked by one linker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkerStats {
    /// Lookup attempts sent to the reference service.
    pub lookups: u64,
    pub alias_hits: u64,
    pub retries: u64,
    pub resolved: u64,
    pub unresolved: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    alias_hits: AtomicU64,
    retries: AtomicU64,
    resolved: AtomicU64,
    unresolved: AtomicU64,
    rejected: AtomicU64,
}

pub struct ConceptLinker {
    lookup: Arc<dyn ReferenceLookup>,
    aliases: Arc<AliasTable>,
    sleeper: Arc<dyn Sleeper>,
    config: LinkerConfig,
    counters: Counters,
}

impl std::fmt::Debug for ConceptLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptLinker")
            .field("lookup", &self.lookup.name())
            .field("aliases", &self.aliases.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ConceptLinker {
    pub fn new(
        lookup: Arc<dyn ReferenceLookup>,
        aliases: Arc<AliasTable>,
        sleeper: Arc<dyn Sleeper>,
        config: LinkerConfig,
    ) -> Self {
        Self {
            lookup,
            aliases,
            sleeper,
            config,
            counters: Counters::default(),
        }
    }

    pub fn aliases(&self) -> &Arc<AliasTable> {
        &self.aliases
    }

    pub fn stats(&self) -> LinkerStats {
        let c = &self.counters;
        LinkerStats {
            lookups: c.lookups.load(Ordering::Relaxed),
            alias_hits: c.alias_hits.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            unresolved: c.unresolved.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Find and resolve concept mentions in `doc`. Never fails.
    pub async fn link(&self, doc: &CanonicalDocument) -> Vec<ConceptMention> {
        let start = Instant::now();
        let candidates = terms::extract_terms(&doc.markdown);

        let mut distinct: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for c in &candidates {
            if distinct.len() >= self.config.max_terms {
                break;
            }
            if seen.insert(c.normalized.as_str()) {
                distinct.push(c.normalized.clone());
            }
        }
        let total_distinct = distinct.len();

        let states: HashMap<String, MentionState> = stream::iter(distinct)
            .map(|term| async move {
                let state = self.resolve(&term).await;
                (term, state)
            })
            .buffer_unordered(self.config.lookup_concurrency.max(1))
            .collect()
            .await;

        let mentions: Vec<ConceptMention> = candidates
            .into_iter()
            .filter_map(|c| {
                let state = states.get(&c.normalized)?.clone();
                Some(ConceptMention {
                    surface: c.surface,
                    normalized: c.normalized,
                    start: c.span.start,
                    end: c.span.end,
                    state,
                })
            })
            .collect();

        info!(
            "Linked {} mentions ({} distinct terms) in {}ms",
            mentions.len(),
            total_distinct,
            start.elapsed().as_millis()
        );
        mentions
    }

    /// Resolve one normalised term.
    pub async fn resolve(&self, term: &str) -> MentionState {
        if let Some(hit) = self.aliases.get(term) {
            self.counters.alias_hits.fetch_add(1, Ordering::Relaxed);
            self.counters.resolved.fetch_add(1, Ordering::Relaxed);
            return MentionState::Resolved {
                reference_id: hit.reference_id,
                title: hit.title,
                confidence: 1.0,
            };
        }

        let policy = &self.config.retry;
        let timeout = policy.attempt_timeout();
        let label = format!("{} lookup '{}'", self.lookup.name(), term);
        let attempted = retry::run(
            policy,
            self.sleeper.as_ref(),
            &label,
            |_| {
                let lookup = Arc::clone(&self.lookup);
                let counters = &self.counters;
                async move {
                    counters.lookups.fetch_add(1, Ordering::Relaxed);
                    match tokio::time::timeout(timeout, lookup.lookup(term)).await {
                        Ok(result) => result,
                        Err(_) => Err(LookupError::Timeout {
                            ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            },
            classify,
        )
        .await;
        self.counters
            .retries
            .fetch_add(u64::from(attempted.attempts.saturating_sub(1)), Ordering::Relaxed);

        let state = match attempted.result {
            Err(e) if e.is_transient() => MentionState::Unresolved {
                attempts: attempted.attempts,
                last_error: Some(e),
            },
            Err(LookupError::NotFound { .. }) => MentionState::Rejected {
                reason: RejectReason::NotFound,
            },
            Err(e) => MentionState::Rejected {
                reason: RejectReason::Permanent {
                    detail: e.to_string(),
                },
            },
            Ok(candidates) => self.choose(term, &candidates),
        };

        let counter = match &state {
            MentionState::Resolved { .. } => &self.counters.resolved,
            MentionState::Unresolved { .. } => &self.counters.unresolved,
            MentionState::Rejected { .. } => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!("'{}' → {:?}", term, state);
        state
    }

    fn choose(&self, term: &str, candidates: &[ReferenceCandidate]) -> MentionState {
        match fuzzy::select(
            term,
            candidates,
            self.config.acceptance_threshold,
            self.config.ambiguity_margin,
        ) {
            Selection::Accepted { index, score } => {
                let chosen = &candidates[index];
                self.aliases.insert(
                    term,
                    AliasEntry {
                        reference_id: chosen.id.clone(),
                        title: chosen.title.clone(),
                    },
                );
                MentionState::Resolved {
                    reference_id: chosen.id.clone(),
                    title: chosen.title.clone(),
                    confidence: score,
                }
            }
            Selection::Ambiguous { titles, .. } => MentionState::Rejected {
                reason: RejectReason::Ambiguous { candidates: titles },
            },
            Selection::BelowThreshold { best, score } => MentionState::Rejected {
                reason: RejectReason::BelowThreshold { best, score },
            },
            Selection::Empty => MentionState::Rejected {
                reason: RejectReason::NotFound,
            },
        }
    }
}

fn classify(e: &LookupError) -> RetryDecision {
    match e {
        LookupError::RateLimited { retry_after_secs } => {
            RetryDecision::Retry(retry_after_secs.map(Duration::from_secs))
        }
        e if e.is_transient() => RetryDecision::Retry(None),
        _ => RetryDecision::GiveUp,
    }
}
