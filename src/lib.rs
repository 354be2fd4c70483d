use std::time::Duration;
use thiserror::Error;

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod discovery;
pub mod enrich;
pub mod expander;
pub mod extractor;
pub mod fetcher;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod prompt;
pub mod search;
pub mod types;

// Re-export commonly used types
pub use aggregator::{Aggregator, Report, ReportEntry};
pub use config::CrawlerConfig;
pub use pipeline::{Pipeline, PipelineState, RunOutcome, RunSummary};
pub use types::{
    Assessment, CandidateUrl, ClassificationResult, Listing, Query, QueryVariant, SearchHit,
};

/// The `CrawlerError` enum represents the errors that end a pipeline run.
///
/// Item-level failures (a single fetch, extraction or classification) never
/// surface here; they are tallied in the run summary instead.
#[derive(Error, Debug)]
pub enum CrawlerError {
    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// Discovery finished without a single surviving candidate.
    #[error("no candidates survived discovery ({failures} search queries failed)")]
    NoCandidates { failures: usize },
    /// Represents an error that occurs while building an HTTP client.
    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration problems. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Failure of a single HTTP fetch after retries were exhausted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP status {status}")]
    Http {
        status: u16,
        /// Delay requested by the server through `Retry-After`, if any.
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            FetchError::InvalidUrl(_) => false,
        }
    }

    /// Short label used when tallying failures.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Http { .. } => "http",
            FetchError::Network(_) => "network",
            FetchError::InvalidUrl(_) => "invalid_url",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Http {
                status: status.as_u16(),
                retry_after: None,
            }
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Failure to turn a candidate URL into a listing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("could not parse page: {0}")]
    ParseFailure(String),
    #[error("page has no content")]
    EmptyPage,
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::Fetch(err) => err.kind(),
            ExtractionError::ParseFailure(_) => "parse_failure",
            ExtractionError::EmptyPage => "empty_page",
        }
    }
}

/// Failure of the external scoring service for one listing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationError {
    #[error("classification timed out")]
    Timeout,
    #[error("scoring service error: {0}")]
    Service(String),
    #[error("invalid scoring response: {0}")]
    InvalidResponse(String),
}

impl ClassificationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClassificationError::Timeout => "timeout",
            ClassificationError::Service(_) => "service",
            ClassificationError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Failure of a single search surface query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("could not decode search response: {0}")]
    Decode(String),
}

impl SearchError {
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Fetch(err) => err.kind(),
            SearchError::Decode(_) => "decode",
        }
    }
}

/// Failure of the keyword enrichment service.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("enrichment request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("could not decode enrichment response: {0}")]
    Decode(String),
}

/// A run-level budget ran out. The pipeline stops gracefully and still
/// aggregates everything collected so far.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BudgetExceeded {
    #[error("candidate budget of {limit} reached")]
    Candidates { limit: usize },
    #[error("run deadline of {limit:?} reached")]
    Duration { limit: Duration },
}

/// A type alias for `Result` with the `CrawlerError` error type.
pub type Result<T> = std::result::Result<T, CrawlerError>;

// Constants

/// The default timeout duration for page fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// The default timeout duration for a single classification call.
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(60);
/// The default wall-clock budget for a whole run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);
/// The default number of concurrent requests.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 5;
/// The default maximum number of retries for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// The default cap on candidates processed per run.
pub const DEFAULT_MAX_CANDIDATES: usize = 100;
