use crate::config::ExpansionConfig;
use crate::enrich::Keyword;
use crate::types::{Query, QueryVariant, VariantKind};
use regex::RegexBuilder;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// The `QueryExpander` turns one seed query into a bounded, deterministic
/// list of search queries.
///
/// Variants are produced in a fixed order: the seed itself, synonym
/// substitutions, templates, then enrichment keywords. Case-insensitive
/// duplicates are dropped and the list is cut at `max_variants`.
pub struct QueryExpander {
    config: ExpansionConfig,
}

impl QueryExpander {
    pub fn new(config: ExpansionConfig) -> Self {
        Self { config }
    }

    pub fn expand(&self, seed: &Query) -> Vec<QueryVariant> {
        self.expand_with_keywords(seed, Vec::new())
    }

    /// Expands `seed`, appending the strongest `seed.enrichment_terms()` keywords.
    pub fn expand_with_keywords(&self, seed: &Query, keywords: Vec<Keyword>) -> Vec<QueryVariant> {
        let text = seed.text();
        let mut candidates: Vec<(String, VariantKind)> = vec![(text.to_string(), VariantKind::Seed)];

        candidates.extend(
            self.synonym_variants(text)
                .into_iter()
                .map(|t| (t, VariantKind::Synonym)),
        );
        candidates.extend(
            self.config
                .templates
                .iter()
                .map(|template| (template.replace("{query}", text), VariantKind::Template)),
        );
        candidates.extend(
            rank_keywords(text, keywords, seed.enrichment_terms())
                .into_iter()
                .map(|t| (t, VariantKind::Enriched)),
        );

        let include_sites = sites(&self.config.marketplaces);
        let exclude_sites = sites(&self.config.excluded_hosts);

        let mut seen = HashSet::new();
        let variants: Vec<QueryVariant> = candidates
            .into_iter()
            .map(|(text, kind)| (collapse_whitespace(&text), kind))
            .filter(|(text, _)| !text.is_empty() && seen.insert(text.to_lowercase()))
            .take(self.config.max_variants)
            .enumerate()
            .map(|(index, (text, kind))| QueryVariant {
                index,
                text,
                kind,
                include_sites: include_sites.clone(),
                exclude_sites: exclude_sites.clone(),
            })
            .collect();

        debug!("Expanded '{}' into {} variants", seed.text(), variants.len());
        variants
    }

    /// One variant per (term, synonym) pair whose term occurs in `text`.
    fn synonym_variants(&self, text: &str) -> Vec<String> {
        let mut variants = Vec::new();
        for (term, synonyms) in &self.config.synonyms {
            let pattern = format!(r"\b{}\b", regex::escape(term));
            let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
                continue;
            };
            if !re.is_match(text) {
                continue;
            }
            for synonym in synonyms {
                variants.push(re.replace_all(text, regex::NoExpand(synonym.as_str())).into_owned());
            }
        }
        variants
    }
}

/// Merges keywords by maximum volume, drops the seed, and keeps the `n`
/// strongest (volume descending, then alphabetical).
pub fn rank_keywords(seed: &str, keywords: Vec<Keyword>, n: usize) -> Vec<String> {
    let mut volumes: BTreeMap<String, u64> = BTreeMap::new();
    for keyword in keywords {
        let text = collapse_whitespace(&keyword.text);
        if text.is_empty() || text.eq_ignore_ascii_case(seed) {
            continue;
        }
        let volume = volumes.entry(text).or_insert(0);
        *volume = (*volume).max(keyword.volume);
    }

    let mut ranked: Vec<(String, u64)> = volumes.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(text, _)| text).collect()
}

fn sites(hosts: &[crate::types::Host]) -> Vec<String> {
    hosts.iter().flat_map(|h| h.domains.iter().cloned()).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
