use crate::config::SearchConfig;
use crate::normalize::normalize_url;
use crate::pipeline::{Interrupted, RunGuard};
use crate::search::SearchClient;
use crate::types::{CandidateUrl, Host, QueryVariant, SearchHit, SourceAttribution};
use crate::SearchError;
use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// A search query that produced no candidates.
#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    pub query: String,
    pub page: u32,
    pub error: SearchError,
}

/// Everything discovery learned, including what went wrong.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Unique candidates in discovery order.
    pub candidates: Vec<CandidateUrl>,
    pub failures: Vec<DiscoveryFailure>,
    /// Hits that resolved to an already known candidate.
    pub duplicates: usize,
    /// Hits dropped as invalid, excluded or out of the target country.
    pub filtered: usize,
    /// Queries that never completed because the run was stopped.
    pub interrupted: usize,
    pub interrupted_by: Option<Interrupted>,
}

/// The `Discoverer` runs query variants against the search surface and
/// collects unique, normalized candidate URLs.
pub struct Discoverer {
    search: Arc<dyn SearchClient>,
    config: SearchConfig,
    marketplaces: Vec<Host>,
    excluded_hosts: Vec<Host>,
    concurrency: usize,
}

impl Discoverer {
    pub fn new(search: Arc<dyn SearchClient>, config: SearchConfig, concurrency: usize) -> Self {
        Self {
            search,
            config,
            marketplaces: Vec::new(),
            excluded_hosts: Vec::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Marketplaces used to attribute a marketplace name to candidates.
    pub fn with_marketplaces(mut self, marketplaces: Vec<Host>) -> Self {
        self.marketplaces = marketplaces;
        self
    }

    pub fn with_excluded_hosts(mut self, hosts: Vec<Host>) -> Self {
        self.excluded_hosts = hosts;
        self
    }

    /// Searches every variant and page concurrently. A failing query costs
    /// only its own results.
    pub async fn discover(&self, variants: &[QueryVariant], guard: &RunGuard) -> DiscoveryOutcome {
        let jobs: Vec<(&QueryVariant, u32)> = variants
            .iter()
            .flat_map(|v| (0..self.config.pages_per_query).map(move |page| (v, page)))
            .collect();

        let mut responses = stream::iter(jobs)
            .map(|(variant, page)| async move {
                let query = variant.search_string();
                let result = guard.run(self.search.search(&query, page)).await;
                (variant, page, query, result)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        // completion order is arbitrary; discovery order is (variant, page)
        responses.sort_by_key(|(variant, page, _, _)| (variant.index, *page));

        let base = self.search.base_url();
        let mut outcome = DiscoveryOutcome::default();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for (variant, page, query, result) in responses {
            let hits = match result {
                Ok(Ok(hits)) => hits,
                Ok(Err(error)) => {
                    warn!("Search '{}' (page {}) failed: {}", query, page, error);
                    outcome.failures.push(DiscoveryFailure { query, page, error });
                    continue;
                }
                Err(interrupted) => {
                    outcome.interrupted += 1;
                    outcome.interrupted_by.get_or_insert(interrupted);
                    continue;
                }
            };

            let offset = (page * self.config.results_per_page) as usize;
            for (position, hit) in hits.into_iter().enumerate() {
                let source = SourceAttribution {
                    query: variant.text.clone(),
                    kind: variant.kind,
                    rank: offset + position + 1,
                    discovered_at: Utc::now(),
                };
                self.merge_hit(hit, source, base.as_ref(), &mut seen, &mut outcome);
            }
        }

        info!(
            "Discovered {} candidates ({} duplicates, {} filtered, {} failed queries)",
            outcome.candidates.len(),
            outcome.duplicates,
            outcome.filtered,
            outcome.failures.len()
        );
        outcome
    }

    fn merge_hit(
        &self,
        hit: SearchHit,
        source: SourceAttribution,
        base: Option<&Url>,
        seen: &mut HashMap<String, usize>,
        outcome: &mut DiscoveryOutcome,
    ) {
        let Some(url) = normalize_url(&hit.url, base) else {
            debug!("Dropping unusable result URL {}", hit.url);
            outcome.filtered += 1;
            return;
        };
        if !self.keep(&url) {
            debug!("Dropping filtered result URL {}", url);
            outcome.filtered += 1;
            return;
        }

        let key = url.to_string();
        if let Some(&idx) = seen.get(&key) {
            let existing = &mut outcome.candidates[idx];
            existing.sources.push(source);
            if existing.snippet.is_none() {
                existing.snippet = hit.snippet;
            }
            outcome.duplicates += 1;
            return;
        }

        let discovery_index = outcome.candidates.len();
        seen.insert(key, discovery_index);
        outcome.candidates.push(CandidateUrl {
            marketplace: self.marketplace_of(&url),
            url,
            discovery_index,
            snippet: hit.snippet,
            title_hint: hit.title,
            sources: vec![source],
        });
    }

    fn keep(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.excluded_hosts.iter().any(|h| h.matches(host)) {
            return false;
        }
        match (&self.config.location, self.config.filter_by_country) {
            (Some(location), true) => {
                let code = location.code.to_lowercase();
                host.ends_with(&format!(".{code}")) || host.ends_with(".com")
            }
            _ => true,
        }
    }

    fn marketplace_of(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        self.marketplaces
            .iter()
            .find(|m| m.matches(host))
            .map(|m| m.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, VariantKind};
    use crate::FetchError;
    use async_trait::async_trait;

    struct StaticSearch {
        results: HashMap<String, Result<Vec<SearchHit>, SearchError>>,
    }

    #[async_trait]
    impl SearchClient for StaticSearch {
        async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, SearchError> {
            if page > 0 {
                return Ok(Vec::new());
            }
            self.results.get(query).cloned().unwrap_or(Ok(Vec::new()))
        }
    }

    fn variant(index: usize, text: &str) -> QueryVariant {
        QueryVariant {
            index,
            text: text.to_string(),
            kind: if index == 0 { VariantKind::Seed } else { VariantKind::Synonym },
            include_sites: Vec::new(),
            exclude_sites: Vec::new(),
        }
    }

    fn hits(urls: &[&str]) -> Result<Vec<SearchHit>, SearchError> {
        Ok(urls.iter().map(|u| SearchHit::new(*u)).collect())
    }

    fn discoverer(results: Vec<(&str, Result<Vec<SearchHit>, SearchError>)>) -> Discoverer {
        let search = StaticSearch {
            results: results.into_iter().map(|(q, r)| (q.to_string(), r)).collect(),
        };
        Discoverer::new(Arc::new(search), SearchConfig::default(), 4)
    }

    #[tokio::test]
    async fn test_dedups_across_variants_and_merges_sources() {
        let discoverer = discoverer(vec![
            ("fake watches", hits(&["https://a.example.com/1", "https://b.example.com/2?utm_source=x"])),
            ("replica watches", hits(&["https://B.example.com/2", "https://c.example.com/3"])),
        ]);
        let variants = vec![variant(0, "fake watches"), variant(1, "replica watches")];

        let outcome = discoverer.discover(&variants, &RunGuard::unbounded()).await;
        let urls: Vec<&str> = outcome.candidates.iter().map(|c| c.url.as_str()).collect();

        assert_eq!(
            urls,
            vec!["https://a.example.com/1", "https://b.example.com/2", "https://c.example.com/3"]
        );
        assert_eq!(outcome.duplicates, 1);
        let shared = &outcome.candidates[1];
        assert_eq!(shared.sources.len(), 2);
        assert_eq!(shared.source_query(), "fake watches");
        assert_eq!(shared.sources[1].query, "replica watches");
        assert_eq!(shared.source_rank(), 2);
    }

    #[tokio::test]
    async fn test_failed_query_does_not_abort_discovery() {
        let discoverer = discoverer(vec![
            ("fake watches", Err(SearchError::Fetch(FetchError::Timeout))),
            ("replica watches", hits(&["https://c.example.com/3"])),
        ]);
        let variants = vec![variant(0, "fake watches"), variant(1, "replica watches")];

        let outcome = discoverer.discover(&variants, &RunGuard::unbounded()).await;

        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].query, "fake watches");
    }

    #[tokio::test]
    async fn test_filters_excluded_hosts_and_foreign_countries() {
        let search = StaticSearch {
            results: [(
                "rolex".to_string(),
                hits(&[
                    "https://shop.example.ch/1",
                    "https://en.wikipedia.org/wiki/Rolex",
                    "https://store.example.it/2",
                    "https://global.example.com/3",
                    "ftp://files.example.ch/4",
                ]),
            )]
            .into_iter()
            .collect(),
        };
        let config = SearchConfig {
            location: Some(Location {
                name: "Switzerland".into(),
                code: "CH".into(),
            }),
            filter_by_country: true,
            ..SearchConfig::default()
        };
        let discoverer = Discoverer::new(Arc::new(search), config, 2)
            .with_excluded_hosts(vec![Host::new("Wikipedia", &["wikipedia.org"])])
            .with_marketplaces(vec![Host::new("Example CH", &["example.ch"])]);

        let outcome = discoverer.discover(&[variant(0, "rolex")], &RunGuard::unbounded()).await;
        let urls: Vec<&str> = outcome.candidates.iter().map(|c| c.url.as_str()).collect();

        assert_eq!(urls, vec!["https://shop.example.ch/1", "https://global.example.com/3"]);
        assert_eq!(outcome.filtered, 3);
        assert_eq!(outcome.candidates[0].marketplace.as_deref(), Some("Example CH"));
        assert_eq!(outcome.candidates[1].marketplace, None);
    }

    #[tokio::test]
    async fn test_cancelled_run_discovers_nothing() {
        let discoverer = discoverer(vec![("fake watches", hits(&["https://a.example.com/1"]))]);
        let guard = RunGuard::unbounded();
        guard.cancel();

        let outcome = discoverer.discover(&[variant(0, "fake watches")], &guard).await;

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.interrupted, 1);
        assert_eq!(outcome.interrupted_by, Some(Interrupted::Cancelled));
    }
}
