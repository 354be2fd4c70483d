use crate::types::{Host, Language, Location};
use crate::ConfigError;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables that override configuration values,
/// e.g. `FRAUDCRAWLER__MAX_CONCURRENCY=8` or `FRAUDCRAWLER__LLM_CONFIG__MODEL=llama3.2`.
pub const ENV_PREFIX: &str = "FRAUDCRAWLER";

/// The `CrawlerConfig` struct holds the configuration settings for a pipeline run.
/// It includes budgets, timeouts, retry and rate limiting settings, and the
/// settings of every external collaborator (search, enrichment, LLM).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// The number of concurrent requests allowed across the whole run.
    pub max_concurrency: usize,
    /// The maximum number of candidate URLs processed per run.
    pub max_candidates: usize,
    /// The number of classification calls allowed in flight at once.
    pub max_concurrent_classifications: usize,
    /// The timeout duration for a single page fetch.
    #[serde(with = "secs")]
    pub fetch_timeout: Duration,
    /// The timeout duration for a single classification call.
    #[serde(with = "secs")]
    pub classify_timeout: Duration,
    /// The number of retries for transient fetch failures.
    pub retry_count: u32,
    /// The wall-clock budget of a run.
    #[serde(with = "secs")]
    pub run_timeout: Duration,
    /// The user agent string to be used in HTTP requests.
    pub user_agent: String,
    /// Whether to draw progress spinners on the terminal.
    pub show_progress: bool,
    /// The rate limit settings for the fetcher.
    pub rate_limit: RateLimit,
    /// The search surface settings.
    pub search: SearchConfig,
    /// The query expansion settings.
    pub expansion: ExpansionConfig,
    /// The keyword enrichment settings, if enrichment is enabled.
    pub enrichment: Option<EnrichmentConfig>,
    /// The configuration settings for the Language Model (LLM).
    pub llm_config: LLMConfig,
}

/// The `RateLimit` struct holds the politeness and backoff settings of the fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// The minimum interval between two requests to the same host.
    #[serde(with = "secs")]
    pub per_host_interval: Duration,
    /// The base delay of the exponential backoff.
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    /// The upper bound of a single backoff delay.
    #[serde(with = "secs")]
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchProvider {
    SerpApi,
    GoogleHtml,
}

/// The `SearchConfig` struct holds the settings of the search surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: SearchProvider,
    /// The endpoint URL of the search surface.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub results_per_page: u32,
    /// The number of result pages requested per query variant.
    pub pages_per_query: u32,
    pub location: Option<Location>,
    pub language: Option<Language>,
    /// Drop results whose domain does not belong to the configured location.
    pub filter_by_country: bool,
}

/// The `ExpansionConfig` struct holds the settings of the query expander.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// The maximum number of query variants produced from one seed.
    pub max_variants: usize,
    /// Alternative spellings per term, applied as whole-word substitutions.
    pub synonyms: BTreeMap<String, Vec<String>>,
    /// Query templates, `{query}` is replaced with the seed text.
    pub templates: Vec<String>,
    /// Marketplaces the search is restricted to.
    pub marketplaces: Vec<Host>,
    /// Hosts excluded from the search.
    pub excluded_hosts: Vec<Host>,
}

/// The `EnrichmentConfig` struct holds the credentials of the keyword enrichment service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub endpoint: String,
    pub user: String,
    pub password: String,
}

/// The `LLMConfig` struct holds the configuration settings for the Language Model (LLM).
/// It includes the endpoint URL, model, temperature, and maximum number of tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// The endpoint URL for the LLM API.
    pub endpoint: String,
    /// The model used for scoring.
    pub model: String,
    /// The temperature setting for the LLM, controlling the randomness of the output.
    pub temperature: f32,
    /// The maximum number of tokens allowed in the LLM response.
    pub max_tokens: u32,
    /// Describes what makes a listing suspicious; used when the query carries no context.
    pub context: String,
    /// Recorded on every classification result.
    pub classifier_version: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: crate::DEFAULT_CONCURRENT_REQUESTS,
            max_candidates: crate::DEFAULT_MAX_CANDIDATES,
            max_concurrent_classifications: crate::DEFAULT_CONCURRENT_REQUESTS,
            fetch_timeout: crate::DEFAULT_FETCH_TIMEOUT,
            classify_timeout: crate::DEFAULT_CLASSIFY_TIMEOUT,
            retry_count: crate::DEFAULT_MAX_RETRIES,
            run_timeout: crate::DEFAULT_RUN_TIMEOUT,
            user_agent: String::from("Mozilla/5.0 (compatible; fraudcrawler/0.1)"),
            show_progress: false,
            rate_limit: RateLimit::default(),
            search: SearchConfig::default(),
            expansion: ExpansionConfig::default(),
            enrichment: None,
            llm_config: LLMConfig::default(),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_host_interval: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProvider::SerpApi,
            endpoint: String::from("https://serpapi.com/search"),
            api_key: None,
            results_per_page: 10,
            pages_per_query: 1,
            location: None,
            language: None,
            filter_by_country: false,
        }
    }
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_variants: 5,
            synonyms: BTreeMap::new(),
            templates: Vec::new(),
            marketplaces: Vec::new(),
            excluded_hosts: Vec::new(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("http://localhost:11434/api/generate"),
            model: String::from("llama3.2:latest"),
            temperature: 0.1,
            max_tokens: 2048,
            context: String::from(
                "Counterfeit, replica or otherwise fraudulent offers of branded goods",
            ),
            classifier_version: String::from("llm-v1"),
        }
    }
}

impl CrawlerConfig {
    /// Loads the configuration from defaults, an optional TOML file and
    /// `FRAUDCRAWLER__*` environment variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&CrawlerConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: CrawlerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&CrawlerConfig::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        let config: CrawlerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if self.max_concurrent_classifications == 0 {
            return Err(invalid("max_concurrent_classifications", "must be at least 1"));
        }
        if self.max_candidates == 0 {
            return Err(invalid("max_candidates", "must be at least 1"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(invalid("fetch_timeout", "must be positive"));
        }
        if self.classify_timeout.is_zero() {
            return Err(invalid("classify_timeout", "must be positive"));
        }
        if self.run_timeout.is_zero() {
            return Err(invalid("run_timeout", "must be positive"));
        }
        if self.expansion.max_variants == 0 {
            return Err(invalid("expansion.max_variants", "must be at least 1"));
        }
        if self.search.pages_per_query == 0 {
            return Err(invalid("search.pages_per_query", "must be at least 1"));
        }
        if url::Url::parse(&self.search.endpoint).is_err() {
            return Err(invalid("search.endpoint", "not an absolute URL"));
        }
        if url::Url::parse(&self.llm_config.endpoint).is_err() {
            return Err(invalid("llm_config.endpoint", "not an absolute URL"));
        }
        if self.search.provider == SearchProvider::SerpApi && self.search.api_key.is_none() {
            return Err(invalid("search.api_key", "required by the serp_api provider"));
        }
        Ok(())
    }
}

/// Durations are written as (fractional) seconds in configuration files.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
