use crate::normalize::url_key;
use crate::types::{Assessment, Listing};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

/// One line of the report: a listing and its score, or why it has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub listing: Listing,
    pub assessment: Assessment,
}

impl ReportEntry {
    pub fn score(&self) -> Option<f64> {
        self.assessment.score()
    }
}

/// Listings ordered by descending fraud score. Unscored listings come last.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub entries: Vec<ReportEntry>,
}

impl Report {
    /// Entries scored at or above `threshold`, in report order.
    pub fn suspicious(&self, threshold: f64) -> Vec<&ReportEntry> {
        self.entries
            .iter()
            .filter(|e| e.score().is_some_and(|s| s >= threshold))
            .collect()
    }

    pub fn scored_count(&self) -> usize {
        self.entries.iter().filter(|e| e.assessment.is_scored()).count()
    }

    pub fn unscored_count(&self) -> usize {
        self.entries.len() - self.scored_count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `Aggregator` merges listings and assessments into a `Report`.
///
/// Entries are keyed by normalized URL. When the same URL arrives twice the
/// source attributions are merged, the earliest discovery index and the most
/// complete field set are kept, and the higher score wins.
#[derive(Debug, Default)]
pub struct Aggregator {
    entries: Vec<ReportEntry>,
    by_url: HashMap<String, usize>,
    merged: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a report in one call.
    pub fn aggregate(items: impl IntoIterator<Item = (Listing, Assessment)>) -> Report {
        let mut aggregator = Self::new();
        for (listing, assessment) in items {
            aggregator.add(listing, assessment);
        }
        aggregator.into_report()
    }

    pub fn add(&mut self, listing: Listing, assessment: Assessment) {
        let key = url_key(&listing.url);
        match self.by_url.get(&key) {
            Some(&idx) => {
                let entry = &mut self.entries[idx];
                merge_listing(&mut entry.listing, listing);
                if better(&assessment, &entry.assessment) {
                    entry.assessment = assessment;
                }
                self.merged += 1;
            }
            None => {
                self.by_url.insert(key, self.entries.len());
                self.entries.push(ReportEntry { listing, assessment });
            }
        }
    }

    /// Number of additions that were merged into an existing entry.
    pub fn merged(&self) -> usize {
        self.merged
    }

    pub fn into_report(self) -> Report {
        let mut entries = self.entries;
        entries.sort_by(report_order);
        debug!("Aggregated {} entries ({} merged)", entries.len(), self.merged);
        Report { entries }
    }
}

fn merge_listing(existing: &mut Listing, incoming: Listing) {
    let discovery_index = existing.discovery_index.min(incoming.discovery_index);
    let mut sources = std::mem::take(&mut existing.sources);
    for source in &incoming.sources {
        if !sources.contains(source) {
            sources.push(source.clone());
        }
    }

    if incoming.completeness() > existing.completeness() {
        *existing = incoming;
    }
    existing.discovery_index = discovery_index;
    existing.sources = sources;
}

/// Whether `candidate` should replace `current`.
fn better(candidate: &Assessment, current: &Assessment) -> bool {
    match (candidate.score(), current.score()) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Score descending with unscored last, then discovery index, then URL.
fn report_order(a: &ReportEntry, b: &ReportEntry) -> Ordering {
    let by_score = match (a.score(), b.score()) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score
        .then_with(|| a.listing.discovery_index.cmp(&b.listing.discovery_index))
        .then_with(|| a.listing.url.as_str().cmp(b.listing.url.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassificationResult, SourceAttribution, VariantKind};
    use chrono::Utc;
    use url::Url;

    fn listing(url: &str, index: usize, query: &str) -> Listing {
        Listing {
            url: Url::parse(url).unwrap(),
            title: None,
            price: None,
            currency: None,
            seller_identifier: None,
            description: None,
            images: Vec::new(),
            raw_snapshot: String::new(),
            partial: true,
            discovery_index: index,
            marketplace: None,
            snippet: None,
            sources: vec![SourceAttribution {
                query: query.into(),
                kind: VariantKind::Seed,
                rank: index + 1,
                discovered_at: Utc::now(),
            }],
            extraction_error: None,
        }
    }

    fn scored(listing: &Listing, score: f64) -> Assessment {
        Assessment::Scored(ClassificationResult {
            listing_url: listing.url.clone(),
            score,
            rationale: String::new(),
            classifier_version: "v".into(),
        })
    }

    fn unscored(reason: &str) -> Assessment {
        Assessment::Unscored { reason: reason.into() }
    }

    #[test]
    fn test_orders_by_score_then_discovery() {
        let a = listing("https://a.example.com/", 0, "q");
        let b = listing("https://b.example.com/", 1, "q");
        let c = listing("https://c.example.com/", 2, "q");
        let d = listing("https://d.example.com/", 3, "q");

        let report = Aggregator::aggregate(vec![
            (a.clone(), unscored("timeout")),
            (b.clone(), scored(&b, 0.4)),
            (c.clone(), scored(&c, 0.9)),
            (d.clone(), scored(&d, 0.4)),
        ]);

        let order: Vec<usize> = report.entries.iter().map(|e| e.listing.discovery_index).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
        assert_eq!(report.scored_count(), 3);
        assert_eq!(report.unscored_count(), 1);
        assert_eq!(report.suspicious(0.5).len(), 1);
    }

    #[test]
    fn test_duplicate_urls_are_merged() {
        let first = listing("https://shop.example.ch/1", 4, "fake watches");
        let mut second = listing("https://shop.example.ch/1", 1, "replica watches");
        second.title = Some("Rolex".into());
        second.price = Some(80.0);

        let mut aggregator = Aggregator::new();
        aggregator.add(first.clone(), scored(&first, 0.3));
        aggregator.add(second.clone(), scored(&second, 0.8));
        aggregator.add(first.clone(), unscored("cancelled"));
        assert_eq!(aggregator.merged(), 2);
        let report = aggregator.into_report();

        assert_eq!(report.len(), 1);
        let entry = &report.entries[0];
        assert_eq!(entry.score(), Some(0.8));
        assert_eq!(entry.listing.discovery_index, 1);
        assert_eq!(entry.listing.title.as_deref(), Some("Rolex"));
        let queries: Vec<&str> = entry.listing.sources.iter().map(|s| s.query.as_str()).collect();
        assert_eq!(queries, vec!["fake watches", "replica watches"]);
    }

    #[test]
    fn test_report_serializes_assessment_status() {
        let a = listing("https://a.example.com/", 0, "q");
        let report = Aggregator::aggregate(vec![(a, unscored("deadline"))]);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["entries"][0]["assessment"]["status"], "unscored");
        assert_eq!(json["entries"][0]["assessment"]["reason"], "deadline");
    }
}
