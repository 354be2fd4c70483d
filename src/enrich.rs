//! Keyword enrichment: additional search terms from an external keyword
//! service, weighted by search volume.

use crate::config::EnrichmentConfig;
use crate::types::{Language, Location};
use crate::EnrichmentError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const SUGGESTIONS_PATH: &str = "/v3/dataforseo_labs/google/keyword_suggestions/live";
const RELATED_PATH: &str = "/v3/dataforseo_labs/google/related_keywords/live";

/// A keyword and its monthly search volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub text: String,
    pub volume: u64,
}

impl Keyword {
    pub fn new(text: impl Into<String>, volume: u64) -> Self {
        Self {
            text: text.into(),
            volume,
        }
    }
}

/// Source of additional search terms for a seed.
#[async_trait]
pub trait KeywordEnricher: Send + Sync {
    async fn keywords(
        &self,
        term: &str,
        language: Option<&Language>,
        location: Option<&Location>,
        limit: usize,
    ) -> Result<Vec<Keyword>, EnrichmentError>;
}

/// DataForSEO Labs client combining keyword suggestions and related keywords.
pub struct DataForSeoEnricher {
    client: Client,
    config: EnrichmentConfig,
}

impl DataForSeoEnricher {
    pub fn new(config: EnrichmentConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).gzip(true).build()?;
        Ok(Self { client, config })
    }

    async fn post(&self, path: &str, task: serde_json::Value) -> Result<TasksResponse, EnrichmentError> {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        debug!("DataForSEO request to {}", url);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&json!([task]))
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| EnrichmentError::Decode(e.to_string()))
    }
}

fn task(term: &str, language: Option<&Language>, location: Option<&Location>, limit: usize) -> serde_json::Value {
    let mut task = json!({ "keyword": term, "limit": limit });
    if let Some(language) = language {
        task["language_name"] = json!(language.name);
    }
    if let Some(location) = location {
        task["location_name"] = json!(location.name);
    }
    task
}

#[async_trait]
impl KeywordEnricher for DataForSeoEnricher {
    async fn keywords(
        &self,
        term: &str,
        language: Option<&Language>,
        location: Option<&Location>,
        limit: usize,
    ) -> Result<Vec<Keyword>, EnrichmentError> {
        let mut suggestion_task = task(term, language, location, limit);
        suggestion_task["include_seed_keyword"] = json!(true);

        let suggested = self.post(SUGGESTIONS_PATH, suggestion_task).await?;
        let related = match self.post(RELATED_PATH, task(term, language, location, limit)).await {
            Ok(related) => related,
            Err(e) => {
                warn!("Related keyword lookup failed for '{}': {}", term, e);
                TasksResponse::default()
            }
        };

        let keywords: Vec<Keyword> = suggested
            .items()
            .chain(related.items())
            .filter_map(Item::into_keyword)
            .collect();
        info!("Found {} enrichment keywords for '{}'", keywords.len(), term);
        Ok(keywords)
    }
}

/// `tasks[].result[].items[]`, any level of which may be null.
#[derive(Debug, Default, Deserialize)]
struct TasksResponse {
    tasks: Option<Vec<Task>>,
}

#[derive(Debug, Deserialize)]
struct Task {
    result: Option<Vec<TaskResult>>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    items: Option<Vec<Item>>,
}

/// Suggestions carry the keyword at the top level, related keywords
/// nest it under `keyword_data`.
#[derive(Debug, Deserialize)]
struct Item {
    keyword: Option<String>,
    keyword_info: Option<KeywordInfo>,
    keyword_data: Option<KeywordData>,
}

#[derive(Debug, Deserialize)]
struct KeywordData {
    keyword: Option<String>,
    keyword_info: Option<KeywordInfo>,
}

#[derive(Debug, Deserialize)]
struct KeywordInfo {
    search_volume: Option<u64>,
}

impl TasksResponse {
    fn items(self) -> impl Iterator<Item = Item> {
        self.tasks
            .into_iter()
            .flatten()
            .flat_map(|t| t.result.into_iter().flatten())
            .flat_map(|r| r.items.into_iter().flatten())
    }
}

impl Item {
    fn into_keyword(self) -> Option<Keyword> {
        let (text, info) = match self.keyword_data {
            Some(data) => (data.keyword, data.keyword_info),
            None => (self.keyword, self.keyword_info),
        };
        let volume = info.and_then(|i| i.search_volume).unwrap_or(0);
        text.map(|text| Keyword::new(text, volume))
    }
}
