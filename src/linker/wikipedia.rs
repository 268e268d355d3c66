//! MediaWiki search API client (`action=query&list=search`).

use super::lookup::{ReferenceCandidate, ReferenceLookup};
use crate::error::{DocError, LookupError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// English Wikipedia's API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Reference lookup backed by a MediaWiki installation.
#[derive(Debug, Clone)]
pub struct WikipediaLookup {
    client: Client,
    endpoint: String,
    max_candidates: usize,
}

impl WikipediaLookup {
    pub fn new(endpoint: impl Into<String>, max_candidates: usize, user_agent: &str) -> Result<Self, DocError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DocError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, endpoint, max_candidates))
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>, max_candidates: usize) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            max_candidates: max_candidates.max(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    query: Option<ApiQuery>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiQuery {
    #[serde(default)]
    search: Vec<ApiHit>,
}

#[derive(Debug, Deserialize)]
struct ApiHit {
    title: String,
    pageid: u64,
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    info: String,
}

fn classify_status(status: StatusCode, retry_after: Option<u64>) -> Option<LookupError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(LookupError::RateLimited {
            retry_after_secs: retry_after,
        })
    } else if status.is_server_error() {
        Some(LookupError::Transient(format!("HTTP {status}")))
    } else if !status.is_success() {
        Some(LookupError::Permanent(format!("HTTP {status}")))
    } else {
        None
    }
}

fn plain_snippet(snippet: &str) -> String {
    let text = RE_TAG.replace_all(snippet, "");
    text.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl ReferenceLookup for WikipediaLookup {
    async fn lookup(&self, term: &str) -> Result<Vec<ReferenceCandidate>, LookupError> {
        let limit = self.max_candidates.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("utf8", "1"),
                ("srsearch", term),
                ("srlimit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LookupError::Transient(e.to_string()))?;

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(e) = classify_status(response.status(), retry_after) {
            return Err(e);
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Transient(format!("undecodable response: {e}")))?;
        if let Some(err) = body.error {
            return Err(if err.code == "ratelimited" {
                LookupError::RateLimited {
                    retry_after_secs: None,
                }
            } else {
                LookupError::Permanent(format!("{}: {}", err.code, err.info))
            });
        }

        let hits = body.query.map(|q| q.search).unwrap_or_default();
        if hits.is_empty() {
            return Err(LookupError::NotFound {
                term: term.to_string(),
            });
        }
        Ok(hits
            .into_iter()
            .take(self.max_candidates)
            .map(|h| ReferenceCandidate {
                id: h.pageid.to_string(),
                title: h.title,
                summary: plain_snippet(&h.snippet),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "wikipedia"
    }
}
