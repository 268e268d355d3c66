//! Configuration for a [`crate::Pipeline`].
//!
//! Every knob lives in [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`]. Setters clamp obviously out-of-range values;
//! [`PipelineConfigBuilder::build`] rejects the rest.

use crate::error::DocError;
use crate::linker::wikipedia::DEFAULT_ENDPOINT;
use crate::linker::LinkerConfig;
use crate::links::FetchConfig;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use std::fmt;
use std::path::PathBuf;

/// Configuration for a conversion pipeline.
///
/// # Example
/// ```rust
/// use docmark::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(8)
///     .cache_capacity(512)
///     .link_concepts(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Documents converted at once by `convert_batch` and the stream API. Default: 4.
    pub concurrency: usize,

    /// Entry ceiling of the in-memory cache tier. Default: 256.
    pub cache_capacity: usize,

    /// Root of the durable cache tier. `None` keeps the cache in memory only.
    pub cache_dir: Option<PathBuf>,

    /// Run the concept linker after conversion. Default: false.
    pub link_concepts: bool,

    /// MediaWiki API endpoint used when linking. Default: English Wikipedia.
    pub lookup_endpoint: String,

    /// Candidates requested per lookup. Default: 5.
    pub max_candidates: usize,

    /// Minimum fuzzy score for a candidate to be accepted. Default: 0.88.
    pub acceptance_threshold: f64,

    /// A runner-up this close to the best score makes a term ambiguous. Default: 0.02.
    pub ambiguity_margin: f64,

    /// Distinct terms looked up at once per document. Default: 4.
    pub lookup_concurrency: usize,

    /// Distinct terms resolved per document. Default: 200.
    pub max_terms_per_document: usize,

    /// Retry policy for reference lookups.
    pub lookup_retry: RetryPolicy,

    /// Alias table file, loaded on construction and written by `save_aliases`.
    pub alias_path: Option<PathBuf>,

    /// Root of the filesystem artifact store. `None` disables storing unless
    /// a backend is injected.
    pub store_dir: Option<PathBuf>,

    /// Retry policy for artifact store operations.
    pub store_retry: RetryPolicy,

    /// Outbound links fetched at once by `fetch_links`. Default: 20.
    pub link_fetch_concurrency: usize,

    /// Outbound links fetched at once from one host. Default: 2.
    pub link_fetch_per_host: usize,

    /// Retry policy for outbound link fetches.
    pub link_fetch_retry: RetryPolicy,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// `User-Agent` for downloads and reference lookups.
    pub user_agent: String,

    /// Optional per-document progress events for batch conversion.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cache_capacity: 256,
            cache_dir: None,
            link_concepts: false,
            lookup_endpoint: DEFAULT_ENDPOINT.to_string(),
            max_candidates: 5,
            acceptance_threshold: 0.88,
            ambiguity_margin: 0.02,
            lookup_concurrency: 4,
            max_terms_per_document: 200,
            lookup_retry: RetryPolicy::default(),
            alias_path: None,
            store_dir: None,
            store_retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 100,
                max_delay_ms: 2_000,
                jitter: 0.2,
                attempt_timeout_ms: 30_000,
            },
            link_fetch_concurrency: 20,
            link_fetch_per_host: 2,
            link_fetch_retry: FetchConfig::default().retry,
            download_timeout_secs: 120,
            user_agent: concat!("docmark/", env!("CARGO_PKG_VERSION")).to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("concurrency", &self.concurrency)
            .field("cache_capacity", &self.cache_capacity)
            .field("cache_dir", &self.cache_dir)
            .field("link_concepts", &self.link_concepts)
            .field("lookup_endpoint", &self.lookup_endpoint)
            .field("acceptance_threshold", &self.acceptance_threshold)
            .field("ambiguity_margin", &self.ambiguity_margin)
            .field("lookup_concurrency", &self.lookup_concurrency)
            .field("max_terms_per_document", &self.max_terms_per_document)
            .field("alias_path", &self.alias_path)
            .field("store_dir", &self.store_dir)
            .field("link_fetch_concurrency", &self.link_fetch_concurrency)
            .field("link_fetch_per_host", &self.link_fetch_per_host)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The linker settings carried by this config.
    pub fn linker_config(&self) -> LinkerConfig {
        LinkerConfig {
            retry: self.lookup_retry.clone(),
            acceptance_threshold: self.acceptance_threshold,
            ambiguity_margin: self.ambiguity_margin,
            lookup_concurrency: self.lookup_concurrency,
            max_terms: self.max_terms_per_document,
        }
    }

    /// The outbound link fetch settings carried by this config.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            concurrency: self.link_fetch_concurrency,
            per_host: self.link_fetch_per_host,
            retry: self.link_fetch_retry.clone(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn cache_capacity(mut self, n: usize) -> Self {
        self.config.cache_capacity = n.max(1);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn link_concepts(mut self, v: bool) -> Self {
        self.config.link_concepts = v;
        self
    }

    pub fn lookup_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.lookup_endpoint = url.into();
        self
    }

    pub fn max_candidates(mut self, n: usize) -> Self {
        self.config.max_candidates = n.clamp(1, 50);
        self
    }

    pub fn acceptance_threshold(mut self, t: f64) -> Self {
        self.config.acceptance_threshold = t;
        self
    }

    pub fn ambiguity_margin(mut self, m: f64) -> Self {
        self.config.ambiguity_margin = m;
        self
    }

    pub fn lookup_concurrency(mut self, n: usize) -> Self {
        self.config.lookup_concurrency = n.max(1);
        self
    }

    pub fn max_terms_per_document(mut self, n: usize) -> Self {
        self.config.max_terms_per_document = n;
        self
    }

    pub fn lookup_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.lookup_retry = policy;
        self
    }

    pub fn alias_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.alias_path = Some(path.into());
        self
    }

    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store_dir = Some(dir.into());
        self
    }

    pub fn store_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.store_retry = policy;
        self
    }

    pub fn link_fetch_concurrency(mut self, n: usize) -> Self {
        self.config.link_fetch_concurrency = n.clamp(1, 256);
        self
    }

    pub fn link_fetch_per_host(mut self, n: usize) -> Self {
        self.config.link_fetch_per_host = n.clamp(1, 16);
        self
    }

    pub fn link_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.link_fetch_retry = policy;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DocError> {
        let c = &self.config;
        if c.concurrency == 0
            || c.lookup_concurrency == 0
            || c.link_fetch_concurrency == 0
            || c.link_fetch_per_host == 0
        {
            return Err(DocError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.cache_capacity == 0 {
            return Err(DocError::InvalidConfig("Cache capacity must be ≥ 1".into()));
        }
        if !(c.acceptance_threshold > 0.0 && c.acceptance_threshold <= 1.0) {
            return Err(DocError::InvalidConfig(format!(
                "Acceptance threshold must be in (0, 1], got {}",
                c.acceptance_threshold
            )));
        }
        if !(0.0..1.0).contains(&c.ambiguity_margin) {
            return Err(DocError::InvalidConfig(format!(
                "Ambiguity margin must be in [0, 1), got {}",
                c.ambiguity_margin
            )));
        }
        for (name, policy) in [
            ("lookup", &c.lookup_retry),
            ("store", &c.store_retry),
            ("link fetch", &c.link_fetch_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(DocError::InvalidConfig(format!(
                    "{name} retry needs at least one attempt"
                )));
            }
            if !(0.0..=1.0).contains(&policy.jitter) {
                return Err(DocError::InvalidConfig(format!(
                    "{name} retry jitter must be in [0, 1], got {}",
                    policy.jitter
                )));
            }
        }
        if c.link_concepts && reqwest::Url::parse(&c.lookup_endpoint).is_err() {
            return Err(DocError::InvalidConfig(format!(
                "Lookup endpoint is not a URL: '{}'",
                c.lookup_endpoint
            )));
        }
        Ok(self.config)
    }
}
