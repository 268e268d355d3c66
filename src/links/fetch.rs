//! Title and description metadata for outbound links.
//!
//! Each URL is fetched with bounded overall concurrency and at most
//! [`FetchConfig::per_host`] requests in flight per host. Failures are
//! collected per URL next to the successes, so one dead link never fails the
//! batch.
//!
//! ```text
//! links ─▶ per-host semaphore ─▶ GET (retry + per-attempt timeout)
//!                                  │
//!                                  ├─ html  ─▶ <title> / og:title, meta description
//!                                  └─ other ─▶ no metadata
//! ```

use super::Link;
use crate::error::{DocError, FetchError};
use crate::retry::{self, RetryDecision, RetryPolicy, Sleeper};
use futures::stream::{self, StreamExt};
use reqwest::{header, Client, StatusCode, Url};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Bytes of a page read before parsing; metadata lives in `<head>`.
pub const MAX_PAGE_BYTES: usize = 512 * 1024;

/// Metadata of one fetched link. Pages that are not HTML carry neither field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetadata {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A link whose metadata could not be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkError {
    pub url: String,
    pub error: FetchError,
    pub attempts: u32,
}

/// Outcome of a batch fetch, in input order within each list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkFetchResult {
    pub links: Vec<LinkMetadata>,
    pub errors: Vec<LinkError>,
}

impl LinkFetchResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn total_attempted(&self) -> usize {
        self.links.len() + self.errors.len()
    }
}

/// Concurrency and retry settings for [`LinkFetcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Requests in flight across all hosts. Default: 20.
    pub concurrency: usize,
    /// Requests in flight per host. Default: 2.
    pub per_host: usize,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            per_host: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 250,
                max_delay_ms: 4_000,
                jitter: 0.2,
                attempt_timeout_ms: 15_000,
            },
        }
    }
}

/// Fetches outbound links and reads their title and description.
pub struct LinkFetcher {
    client: Client,
    config: FetchConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for LinkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkFetcher").field("config", &self.config).finish()
    }
}

impl LinkFetcher {
    pub fn new(user_agent: &str, config: FetchConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self, DocError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DocError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, config, sleeper))
    }

    pub fn with_client(client: Client, config: FetchConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            client,
            config,
            sleeper,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch every link. Never fails; per-URL failures land in `errors`.
    pub async fn fetch_all(&self, links: &[Link]) -> LinkFetchResult {
        if links.is_empty() {
            return LinkFetchResult::default();
        }
        let per_host = self.config.per_host.max(1);
        let mut hosts: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let jobs: Vec<(&str, Arc<Semaphore>)> = links
            .iter()
            .map(|link| {
                let gate = hosts
                    .entry(host_key(&link.url))
                    .or_insert_with(|| Arc::new(Semaphore::new(per_host)));
                (link.url.as_str(), Arc::clone(gate))
            })
            .collect();
        info!("Fetching {} link(s) across {} host(s)", jobs.len(), hosts.len());

        let outcomes: Vec<Result<LinkMetadata, LinkError>> = stream::iter(jobs)
            .map(|(url, gate)| async move {
                let _permit = gate.acquire_owned().await;
                self.fetch(url).await
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut result = LinkFetchResult::default();
        for outcome in outcomes {
            match outcome {
                Ok(meta) => result.links.push(meta),
                Err(e) => {
                    warn!("Could not fetch '{}': {}", e.url, e.error);
                    result.errors.push(e);
                }
            }
        }
        info!(
            "Fetched {}/{} link(s), {} failed",
            result.links.len(),
            result.total_attempted(),
            result.errors.len()
        );
        result
    }

    /// Fetch one link under the retry policy.
    pub async fn fetch(&self, url: &str) -> Result<LinkMetadata, LinkError> {
        let parsed = match Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => u,
            _ => {
                return Err(LinkError {
                    url: url.to_string(),
                    error: FetchError::Permanent("not an http(s) URL".into()),
                    attempts: 0,
                })
            }
        };

        let policy = &self.config.retry;
        let timeout = policy.attempt_timeout();
        let label = format!("fetch '{url}'");
        let attempted = retry::run(
            policy,
            self.sleeper.as_ref(),
            &label,
            |_| {
                let parsed = parsed.clone();
                async move {
                    match tokio::time::timeout(timeout, self.fetch_once(url, parsed)).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout {
                            ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            },
            classify,
        )
        .await;

        attempted.result.map_err(|error| LinkError {
            url: url.to_string(),
            error,
            attempts: attempted.attempts,
        })
    }

    async fn fetch_once(&self, url: &str, target: Url) -> Result<LinkMetadata, FetchError> {
        let mut response = self.client.get(target).send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Permanent(e.to_string())
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(e) = classify_status(response.status(), retry_after) {
            return Err(e);
        }

        let is_html = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |ct| ct.to_ascii_lowercase().contains("html"));
        if !is_html {
            debug!("'{}' is not HTML, no metadata", url);
            return Ok(LinkMetadata {
                url: url.to_string(),
                title: None,
                description: None,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Transient(format!("body: {e}")))?
        {
            body.extend_from_slice(&chunk);
            if body.len() >= MAX_PAGE_BYTES {
                body.truncate(MAX_PAGE_BYTES);
                break;
            }
        }
        Ok(page_metadata(url, &String::from_utf8_lossy(&body)))
    }
}

/// Title and description declared by an HTML page.
///
/// Title prefers `og:title` over `<title>`; description prefers
/// `<meta name="description">` over `og:description`.
pub fn page_metadata(url: &str, html: &str) -> LinkMetadata {
    let dom = Html::parse_document(html);
    let mut title_tag = None;
    let mut og_title = None;
    let mut description = None;
    let mut og_description = None;

    for el in dom.root_element().descendants().filter_map(ElementRef::wrap) {
        match el.value().name() {
            "title" if title_tag.is_none() => title_tag = clean(&el.text().collect::<String>()),
            "meta" => {
                let v = el.value();
                let key = v.attr("property").or_else(|| v.attr("name")).unwrap_or_default();
                let slot = match key.to_ascii_lowercase().as_str() {
                    "og:title" => &mut og_title,
                    "description" => &mut description,
                    "og:description" => &mut og_description,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = v.attr("content").and_then(clean);
                }
            }
            _ => {}
        }
    }

    LinkMetadata {
        url: url.to_string(),
        title: og_title.or(title_tag),
        description: description.or(og_description),
    }
}

fn clean(s: &str) -> Option<String> {
    let joined = s.split_whitespace().collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn host_key(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}

fn classify_status(status: StatusCode, retry_after: Option<u64>) -> Option<FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(FetchError::RateLimited {
            retry_after_secs: retry_after,
        })
    } else if status.is_server_error() {
        Some(FetchError::Transient(format!("HTTP {status}")))
    } else if !status.is_success() {
        Some(FetchError::Permanent(format!("HTTP {status}")))
    } else {
        None
    }
}

fn classify(e: &FetchError) -> RetryDecision {
    match e {
        FetchError::RateLimited { retry_after_secs } => {
            RetryDecision::Retry(retry_after_secs.map(Duration::from_secs))
        }
        e if e.is_transient() => RetryDecision::Retry(None),
        _ => RetryDecision::GiveUp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::TokioSleeper;

    fn fetcher() -> LinkFetcher {
        LinkFetcher::new("docmark-tests/0", FetchConfig::default(), Arc::new(TokioSleeper)).unwrap()
    }

    #[test]
    fn open_graph_title_wins_over_title_tag() {
        let html = r#"<html><head>
            <title>  Plain
              title </title>
            <meta property="og:title" content="Shared title">
            <meta name="description" content="What the page is about.">
            <meta property="og:description" content="Social blurb">
        </head><body><title>ignored</title></body></html>"#;
        let meta = page_metadata("https://example.com/", html);
        assert_eq!(meta.title.as_deref(), Some("Shared title"));
        assert_eq!(meta.description.as_deref(), Some("What the page is about."));
    }

    #[test]
    fn falls_back_to_title_tag_and_og_description() {
        let html = r#"<head><title>Plain title</title><meta property="og:description" content="Blurb"></head>"#;
        let meta = page_metadata("https://example.com/", html);
        assert_eq!(meta.title.as_deref(), Some("Plain title"));
        assert_eq!(meta.description.as_deref(), Some("Blurb"));
    }

    #[test]
    fn blank_metadata_is_absent() {
        let meta = page_metadata("https://example.com/", r#"<title>   </title><meta name="description" content="">"#);
        assert_eq!(meta.title, None);
        assert_eq!(meta.description, None);
    }

    #[test]
    fn statuses_map_to_retry_classes() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(4)),
            Some(FetchError::RateLimited { retry_after_secs: Some(4) })
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(FetchError::Permanent(_))
        ));
        assert_eq!(classify_status(StatusCode::OK, None), None);
        assert_eq!(
            classify(&FetchError::RateLimited { retry_after_secs: Some(4) }),
            RetryDecision::Retry(Some(Duration::from_secs(4)))
        );
        assert_eq!(classify(&FetchError::Permanent("x".into())), RetryDecision::GiveUp);
    }

    #[test]
    fn hosts_bucket_case_insensitively() {
        assert_eq!(host_key("https://Example.COM/a"), "example.com");
        assert_eq!(host_key("http://example.com:8080/b"), "example.com");
        assert_eq!(host_key("not a url"), "");
    }

    #[tokio::test]
    async fn empty_batch_makes_no_requests() {
        let result = fetcher().fetch_all(&[]).await;
        assert_eq!(result, LinkFetchResult::default());
        assert!(!result.has_errors());
        assert_eq!(result.total_attempted(), 0);
    }

    #[tokio::test]
    async fn non_http_urls_fail_without_attempts() {
        let err = fetcher().fetch("ftp://example.com/file").await.unwrap_err();
        assert_eq!(err.attempts, 0);
        assert!(matches!(err.error, FetchError::Permanent(_)));
    }
}
