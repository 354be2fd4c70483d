use crate::config::{SearchConfig, SearchProvider};
use crate::fetcher::Fetcher;
use crate::types::SearchHit;
use crate::SearchError;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// A search surface: one query page in, result URLs with snippets out.
///
/// `page` is zero-based.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, SearchError>;

    /// Base against which relative result URLs are resolved.
    fn base_url(&self) -> Option<Url> {
        None
    }
}

/// Builds the client selected by `config.provider`.
pub fn client_for(config: &SearchConfig, fetcher: Arc<Fetcher>) -> Result<Arc<dyn SearchClient>, SearchError> {
    let client: Arc<dyn SearchClient> = match config.provider {
        SearchProvider::SerpApi => Arc::new(SerpApiClient::new(config.clone(), fetcher)?),
        SearchProvider::GoogleHtml => Arc::new(GoogleHtmlClient::new(config.clone(), fetcher)?),
    };
    Ok(client)
}

fn parse_endpoint(endpoint: &str) -> Result<Url, SearchError> {
    Url::parse(endpoint).map_err(|e| SearchError::Decode(format!("invalid search endpoint {endpoint}: {e}")))
}

/// The `SerpApiClient` queries SerpApi's Google engine and reads its
/// `organic_results`.
pub struct SerpApiClient {
    fetcher: Arc<Fetcher>,
    config: SearchConfig,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    link: Option<String>,
    title: Option<String>,
    snippet: Option<String>,
}

impl SerpApiClient {
    pub fn new(config: SearchConfig, fetcher: Arc<Fetcher>) -> Result<Self, SearchError> {
        let endpoint = parse_endpoint(&config.endpoint)?;
        Ok(Self {
            fetcher,
            config,
            endpoint,
        })
    }

    fn request_url(&self, query: &str, page: u32) -> Url {
        let num = self.config.results_per_page;
        let mut url = self.endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params
                .append_pair("engine", "google")
                .append_pair("q", query)
                .append_pair("num", &num.to_string())
                .append_pair("start", &(page * num).to_string());
            if let Some(key) = &self.config.api_key {
                params.append_pair("api_key", key);
            }
            if let Some(location) = &self.config.location {
                params
                    .append_pair("location", &location.name)
                    .append_pair("gl", &location.code);
            }
            if let Some(language) = &self.config.language {
                params.append_pair("hl", &language.code);
            }
        }
        url
    }

    /// Turns a SerpApi JSON body into hits, skipping results without a link.
    pub fn parse_response(body: &str) -> Result<Vec<SearchHit>, SearchError> {
        let response: SerpResponse =
            serde_json::from_str(body).map_err(|e| SearchError::Decode(e.to_string()))?;
        if let Some(error) = response.error {
            if response.organic_results.is_empty() && !error.contains("hasn't returned any results") {
                return Err(SearchError::Decode(error));
            }
        }

        Ok(response
            .organic_results
            .into_iter()
            .filter_map(|r| {
                Some(SearchHit {
                    url: r.link?,
                    title: r.title,
                    snippet: r.snippet,
                })
            })
            .collect())
    }
}

#[async_trait]
impl SearchClient for SerpApiClient {
    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, SearchError> {
        info!("SerpApi search for '{}' (page {})", query, page);
        let page = self.fetcher.fetch(&self.request_url(query, page)).await?;
        let hits = Self::parse_response(&page.body)?;
        info!("Found {} results for '{}'", hits.len(), query);
        Ok(hits)
    }
}

/// The `GoogleHtmlClient` scrapes a Google-style results page.
pub struct GoogleHtmlClient {
    fetcher: Arc<Fetcher>,
    config: SearchConfig,
    endpoint: Url,
}

impl GoogleHtmlClient {
    pub fn new(config: SearchConfig, fetcher: Arc<Fetcher>) -> Result<Self, SearchError> {
        let endpoint = parse_endpoint(&config.endpoint)?;
        Ok(Self {
            fetcher,
            config,
            endpoint,
        })
    }

    fn request_url(&self, query: &str, page: u32) -> Result<Url, SearchError> {
        let num = self.config.results_per_page;
        let language = self
            .config
            .language
            .as_ref()
            .map(|l| l.code.as_str())
            .unwrap_or("en");
        let url = format!(
            "{}?q={}&hl={}&num={}&start={}",
            self.endpoint.as_str().trim_end_matches('?'),
            urlencoding::encode(query),
            language,
            num,
            page * num
        );
        debug!("Search URL: {}", url);
        parse_endpoint(&url)
    }

    /// Extracts result URLs, trying several selector patterns in order.
    pub fn extract_hits(&self, document: &Html) -> Vec<SearchHit> {
        let selector_patterns = [
            "div.g div.yuRUbf > a",
            "div.tF2Cxc > div.yuRUbf > a",
            "div.g a[href]",
            "div.rc > a",
            "div.r > a",
            "a[data-ved]",
        ];

        let mut hits: Vec<SearchHit> = Vec::new();
        for pattern in selector_patterns {
            let Ok(selector) = Selector::parse(pattern) else {
                continue;
            };
            for link in document.select(&selector) {
                let Some(href) = link.value().attr("href") else {
                    continue;
                };
                let Some(url) = self.clean_google_url(href) else {
                    debug!("Could not clean URL: {}", href);
                    continue;
                };
                if !self.is_valid_url(&url) || hits.iter().any(|h| h.url == url) {
                    continue;
                }
                let title = link.text().collect::<Vec<_>>().join(" ").trim().to_string();
                let mut hit = SearchHit::new(url);
                if !title.is_empty() {
                    hit = hit.with_title(title);
                }
                hits.push(hit);
            }
        }

        debug!("Extracted {} result URLs", hits.len());
        hits
    }

    /// Unwraps `/url?q=` redirect links; passes absolute URLs through.
    fn clean_google_url(&self, url: &str) -> Option<String> {
        if let Some(idx) = url.find("/url?") {
            let query = &url[idx + "/url?".len()..];
            let target = query.split('&').find_map(|pair| pair.strip_prefix("q="))?;
            return urlencoding::decode(target).ok().map(|d| d.into_owned());
        }

        if url.starts_with("http") {
            return Some(url.to_string());
        }

        None
    }

    fn is_valid_url(&self, url: &str) -> bool {
        let invalid_patterns = [
            "google.com/search",
            "google.com/url",
            "google.com/imgres",
            "accounts.google",
            "webcache.googleusercontent",
            "/preferences",
            "/settings",
            "/advanced_search",
            "/setprefs",
            "javascript:",
        ];

        url.starts_with("http") && !invalid_patterns.iter().any(|&pattern| url.contains(pattern))
    }
}

#[async_trait]
impl SearchClient for GoogleHtmlClient {
    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, SearchError> {
        info!("Searching for '{}' (page {})", query, page);
        let response = self.fetcher.fetch(&self.request_url(query, page)?).await?;
        let document = Html::parse_document(&response.body);
        Ok(self.extract_hits(&document))
    }

    fn base_url(&self) -> Option<Url> {
        Some(self.endpoint.clone())
    }
}
