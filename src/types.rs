use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A marketplace host, e.g. `Host { name: "Galaxus", domains: ["galaxus.ch", "digitec.ch"] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub domains: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>, domains: &[&str]) -> Self {
        Self {
            name: name.into(),
            domains: domains.iter().map(|d| d.trim().to_lowercase()).collect(),
        }
    }

    /// Whether `host` is one of the domains or a subdomain of one.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_start_matches("www.");
        self.domains.iter().any(|domain| {
            let domain = domain.trim_start_matches("www.");
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

/// A search location, e.g. `Location { name: "Switzerland", code: "ch" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub code: String,
}

/// A search language, e.g. `Language { name: "German", code: "de" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub code: String,
}

/// The seed of a run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    text: String,
    context: Option<String>,
    enrichment_terms: usize,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            context: None,
            enrichment_terms: 0,
        }
    }

    /// Describes what the classifier should treat as suspicious for this run.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Number of additional search terms requested from the keyword enricher.
    pub fn with_enrichment_terms(mut self, n: usize) -> Self {
        self.enrichment_terms = n;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn enrichment_terms(&self) -> usize {
        self.enrichment_terms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Seed,
    Synonym,
    Template,
    Enriched,
}

/// One search query derived from the seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryVariant {
    /// Position in the expansion output; orders discovery.
    pub index: usize,
    pub text: String,
    pub kind: VariantKind,
    pub include_sites: Vec<String>,
    pub exclude_sites: Vec<String>,
}

impl QueryVariant {
    /// The text sent to the search surface, with `site:` operators applied.
    pub fn search_string(&self) -> String {
        let mut parts = vec![self.text.clone()];
        if !self.include_sites.is_empty() {
            let sites = self
                .include_sites
                .iter()
                .map(|site| format!("site:{site}"))
                .collect::<Vec<_>>()
                .join(" OR ");
            parts.push(sites);
        }
        parts.extend(self.exclude_sites.iter().map(|site| format!("-site:{site}")));
        parts.join(" ")
    }
}

/// A single result returned by a search surface, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

impl SearchHit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            snippet: None,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Which query found a URL, and where.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttribution {
    pub query: String,
    pub kind: VariantKind,
    /// 1-based position in the result list of that query.
    pub rank: usize,
    pub discovered_at: DateTime<Utc>,
}

/// A URL discovered as potentially containing a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateUrl {
    /// Normalized URL; the identity of the candidate.
    pub url: Url,
    /// Order of first discovery within the run.
    pub discovery_index: usize,
    pub snippet: Option<String>,
    pub title_hint: Option<String>,
    pub marketplace: Option<String>,
    /// Every query that found this URL, first discovery first. Never empty.
    pub sources: Vec<SourceAttribution>,
}

impl CandidateUrl {
    pub fn source_query(&self) -> &str {
        self.sources.first().map(|s| s.query.as_str()).unwrap_or_default()
    }

    pub fn source_rank(&self) -> usize {
        self.sources.first().map(|s| s.rank).unwrap_or_default()
    }

    pub fn discovered_at(&self) -> Option<DateTime<Utc>> {
        self.sources.first().map(|s| s.discovered_at)
    }
}

/// A single marketplace item candidate under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub url: Url,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub seller_identifier: Option<String>,
    pub description: Option<String>,
    /// Absolute product image URLs, in page order.
    pub images: Vec<String>,
    /// Visible page text, truncated.
    pub raw_snapshot: String,
    /// Set when one or more structured fields could not be extracted.
    pub partial: bool,
    pub discovery_index: usize,
    pub marketplace: Option<String>,
    pub snippet: Option<String>,
    pub sources: Vec<SourceAttribution>,
    pub extraction_error: Option<String>,
}

impl Listing {
    /// A listing carrying only what discovery knew about the candidate.
    pub fn stub(candidate: &CandidateUrl, error: impl Into<String>) -> Self {
        Self {
            url: candidate.url.clone(),
            title: candidate.title_hint.clone(),
            price: None,
            currency: None,
            seller_identifier: None,
            description: None,
            images: Vec::new(),
            raw_snapshot: String::new(),
            partial: true,
            discovery_index: candidate.discovery_index,
            marketplace: candidate.marketplace.clone(),
            snippet: candidate.snippet.clone(),
            sources: candidate.sources.clone(),
            extraction_error: Some(error.into()),
        }
    }

    /// Number of structured fields that were populated.
    pub fn completeness(&self) -> usize {
        [
            self.title.is_some(),
            self.price.is_some(),
            self.currency.is_some(),
            self.seller_identifier.is_some(),
            self.description.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// The verdict of the scoring service for one listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub listing_url: Url,
    /// Fraud likelihood in `[0, 1]`.
    pub score: f64,
    pub rationale: String,
    pub classifier_version: String,
}

/// Either a score or an explicit reason why there is none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Assessment {
    Scored(ClassificationResult),
    Unscored { reason: String },
}

impl Assessment {
    pub fn score(&self) -> Option<f64> {
        match self {
            Assessment::Scored(result) => Some(result.score),
            Assessment::Unscored { .. } => None,
        }
    }

    pub fn is_scored(&self) -> bool {
        matches!(self, Assessment::Scored(_))
    }
}

/// A fetched page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}
