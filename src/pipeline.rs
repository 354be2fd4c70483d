use crate::aggregator::{Aggregator, Report};
use crate::classifier::Classifier;
use crate::config::CrawlerConfig;
use crate::discovery::{Discoverer, DiscoveryOutcome};
use crate::enrich::{DataForSeoEnricher, Keyword, KeywordEnricher};
use crate::expander::QueryExpander;
use crate::extractor::ContentExtractor;
use crate::fetcher::Fetcher;
use crate::llm::{LlmScorer, ScoringService};
use crate::search::{client_for, SearchClient};
use crate::types::{Assessment, CandidateUrl, Listing, Query, QueryVariant};
use crate::{BudgetExceeded, ConfigError, CrawlerError, Result};
use futures::{stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why in-flight work stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupted {
    Cancelled,
    Deadline,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::Cancelled => write!(f, "run cancelled"),
            Interrupted::Deadline => write!(f, "run deadline reached"),
        }
    }
}

/// Cancellation token and deadline shared by every item future of a run.
#[derive(Debug, Clone)]
pub struct RunGuard {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunGuard {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    /// A guard that only stops on `cancel()`.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The reason the run must stop, if it must.
    pub fn interrupted(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            Some(Interrupted::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interrupted::Deadline)
        } else {
            None
        }
    }

    /// Drives `fut` until it completes or the run is stopped, whichever
    /// comes first. Cancellation wins a tie with completion.
    pub async fn run<F: Future>(&self, fut: F) -> std::result::Result<F::Output, Interrupted> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::Deadline),
            output = fut => Ok(output),
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Expanding,
    Discovering,
    Extracting,
    Classifying,
    Aggregating,
    Done,
    Failed,
}

impl PipelineState {
    /// Stages run in order; an early stop jumps straight to `Aggregating`.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Expanding)
                | (Expanding, Discovering)
                | (Discovering, Extracting)
                | (Extracting, Classifying)
                | (Expanding | Discovering | Extracting | Classifying, Aggregating)
                | (Aggregating, Done)
                | (Idle | Expanding | Discovering, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// Per-stage counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTally {
    pub attempted: usize,
    pub succeeded: usize,
    /// Failures by error kind.
    pub failed: BTreeMap<String, usize>,
    /// Items dropped because the run stopped.
    pub interrupted: usize,
}

impl StageTally {
    fn fail(&mut self, kind: &str) {
        *self.failed.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }
}

/// Run diagnostics returned next to the report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub states: Vec<PipelineState>,
    pub variants: usize,
    pub enrichment_failed: bool,
    pub discovery: StageTally,
    pub extraction: StageTally,
    pub classification: StageTally,
    /// Unique candidates found before the candidate budget was applied.
    pub candidates: usize,
    pub duplicates: usize,
    pub filtered: usize,
    pub dropped_by_budget: usize,
    pub budget_exceeded: Vec<BudgetExceeded>,
    pub stopped_by: Option<Interrupted>,
    pub elapsed: Duration,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            states: vec![PipelineState::Idle],
            variants: 0,
            enrichment_failed: false,
            discovery: StageTally::default(),
            extraction: StageTally::default(),
            classification: StageTally::default(),
            candidates: 0,
            duplicates: 0,
            filtered: 0,
            dropped_by_budget: 0,
            budget_exceeded: Vec::new(),
            stopped_by: None,
            elapsed: Duration::ZERO,
        }
    }
}

impl RunSummary {
    pub fn state(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Idle)
    }

    pub fn cancelled(&self) -> bool {
        self.stopped_by == Some(Interrupted::Cancelled)
    }

    fn enter(&mut self, next: PipelineState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!("Unexpected pipeline transition {:?} -> {:?}", current, next);
        }
        info!("Pipeline state: {:?} -> {:?}", current, next);
        self.states.push(next);
    }

    fn stop(&mut self, reason: Interrupted, run_timeout: Duration) {
        if self.stopped_by.is_some() {
            return;
        }
        warn!("Stopping early: {}", reason);
        self.stopped_by = Some(reason);
        if reason == Interrupted::Deadline {
            self.budget_exceeded
                .push(BudgetExceeded::Duration { limit: run_timeout });
        }
    }

    fn record_discovery(&mut self, outcome: &DiscoveryOutcome, attempted: usize) {
        self.discovery.attempted = attempted;
        for failure in &outcome.failures {
            self.discovery.fail(failure.error.kind());
        }
        self.discovery.interrupted = outcome.interrupted;
        self.discovery.succeeded = attempted
            .saturating_sub(outcome.failures.len())
            .saturating_sub(outcome.interrupted);
        self.candidates = outcome.candidates.len();
        self.duplicates = outcome.duplicates;
        self.filtered = outcome.filtered;
    }
}

/// The ordered report and the diagnostics of the run that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub report: Report,
    pub summary: RunSummary,
}

/// The `Pipeline` drives one seed query through expansion, discovery,
/// extraction, classification and aggregation.
pub struct Pipeline {
    config: CrawlerConfig,
    expander: QueryExpander,
    extractor: ContentExtractor,
    search: Arc<dyn SearchClient>,
    scorer: Arc<dyn ScoringService>,
    enricher: Option<Arc<dyn KeywordEnricher>>,
    progress: MultiProgress,
}

/// Builds a `Pipeline`, optionally with injected search, scoring and
/// enrichment services.
pub struct PipelineBuilder {
    config: CrawlerConfig,
    search: Option<Arc<dyn SearchClient>>,
    scorer: Option<Arc<dyn ScoringService>>,
    enricher: Option<Arc<dyn KeywordEnricher>>,
}

impl PipelineBuilder {
    pub fn search(mut self, search: Arc<dyn SearchClient>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn ScoringService>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn KeywordEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let fetcher = Arc::new(Fetcher::new(&config)?);
        let search = match self.search {
            Some(search) => search,
            None => client_for(&config.search, fetcher.clone()).map_err(|e| ConfigError::Invalid {
                field: "search.endpoint",
                reason: e.to_string(),
            })?,
        };
        let scorer: Arc<dyn ScoringService> = match self.scorer {
            Some(scorer) => scorer,
            None => Arc::new(LlmScorer::new(config.llm_config.clone(), config.classify_timeout)?),
        };
        let enricher: Option<Arc<dyn KeywordEnricher>> = match (self.enricher, &config.enrichment) {
            (Some(enricher), _) => Some(enricher),
            (None, Some(settings)) => Some(Arc::new(DataForSeoEnricher::new(
                settings.clone(),
                config.fetch_timeout,
            )?)),
            (None, None) => None,
        };

        let progress = if config.show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        Ok(Pipeline {
            expander: QueryExpander::new(config.expansion.clone()),
            extractor: ContentExtractor::new(fetcher),
            search,
            scorer,
            enricher,
            progress,
            config,
        })
    }
}

impl Pipeline {
    /// Creates a pipeline with the search, scoring and enrichment clients
    /// described by `config`.
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CrawlerConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            search: None,
            scorer: None,
            enricher: None,
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub async fn run(&self, query: Query) -> Result<RunOutcome> {
        self.run_with_cancellation(query, CancellationToken::new()).await
    }

    /// Runs the pipeline until it completes, the run deadline passes or
    /// `token` is cancelled. An early stop still returns a report of
    /// everything collected so far.
    pub async fn run_with_cancellation(&self, query: Query, token: CancellationToken) -> Result<RunOutcome> {
        let started = Instant::now();
        let guard = RunGuard::new(token, started.checked_add(self.config.run_timeout));
        let mut summary = RunSummary::default();
        info!("Starting run for '{}'", query.text());

        summary.enter(PipelineState::Expanding);
        let variants = self.expand(&query, &guard, &mut summary).await;
        summary.variants = variants.len();

        summary.enter(PipelineState::Discovering);
        let discovery = self.discover(&variants, &guard).await;
        let attempted = variants.len() * self.config.search.pages_per_query as usize;
        summary.record_discovery(&discovery, attempted);
        if let Some(reason) = discovery.interrupted_by {
            summary.stop(reason, self.config.run_timeout);
        }

        let failures = discovery.failures.len();
        let mut candidates = discovery.candidates;
        if candidates.len() > self.config.max_candidates {
            let limit = self.config.max_candidates;
            summary.dropped_by_budget = candidates.len() - limit;
            summary.budget_exceeded.push(BudgetExceeded::Candidates { limit });
            warn!(
                "Candidate budget of {} reached, dropping {} candidates",
                limit, summary.dropped_by_budget
            );
            candidates.truncate(limit);
        }

        if candidates.is_empty() && summary.stopped_by.is_none() {
            summary.enter(PipelineState::Failed);
            error!(
                "No candidates survived discovery for '{}' ({} failed queries)",
                query.text(),
                failures
            );
            return Err(CrawlerError::NoCandidates { failures });
        }

        let mut settled: Vec<(Listing, Assessment)> = Vec::new();
        let mut pending: Vec<Listing> = Vec::new();

        match summary.stopped_by {
            Some(reason) => settled.extend(candidates.iter().map(|c| unreached(c, reason))),
            None => {
                summary.enter(PipelineState::Extracting);
                for (listing, interrupted) in self.extract_all(candidates, &guard, &mut summary).await {
                    match interrupted {
                        Some(reason) => {
                            summary.stop(reason, self.config.run_timeout);
                            settled.push((listing, unscored(reason)));
                        }
                        None => pending.push(listing),
                    }
                }
            }
        }

        match summary.stopped_by {
            Some(reason) => settled.extend(pending.into_iter().map(|l| (l, unscored(reason)))),
            None => {
                summary.enter(PipelineState::Classifying);
                let classified = self.classify_all(&query, pending, &guard, &mut summary).await;
                for (listing, assessment) in classified {
                    let assessment = assessment.unwrap_or_else(|reason| {
                        summary.stop(reason, self.config.run_timeout);
                        unscored(reason)
                    });
                    settled.push((listing, assessment));
                }
            }
        }

        summary.enter(PipelineState::Aggregating);
        let report = Aggregator::aggregate(settled);

        summary.enter(PipelineState::Done);
        summary.elapsed = started.elapsed();
        info!(
            "Run for '{}' finished in {:.2?}: {} listings, {} scored, {} unscored",
            query.text(),
            summary.elapsed,
            report.len(),
            report.scored_count(),
            report.unscored_count()
        );

        Ok(RunOutcome { report, summary })
    }

    async fn expand(&self, query: &Query, guard: &RunGuard, summary: &mut RunSummary) -> Vec<QueryVariant> {
        let keywords = match (&self.enricher, query.enrichment_terms()) {
            (Some(enricher), n) if n > 0 => {
                let lookup = enricher.keywords(
                    query.text(),
                    self.config.search.language.as_ref(),
                    self.config.search.location.as_ref(),
                    keyword_limit(n),
                );
                match guard.run(lookup).await {
                    Ok(Ok(keywords)) => keywords,
                    Ok(Err(e)) => {
                        warn!("Keyword enrichment failed for '{}': {}", query.text(), e);
                        summary.enrichment_failed = true;
                        Vec::<Keyword>::new()
                    }
                    Err(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        };

        let variants = self.expander.expand_with_keywords(query, keywords);
        info!("Expanded '{}' into {} search queries", query.text(), variants.len());
        variants
    }

    async fn discover(&self, variants: &[QueryVariant], guard: &RunGuard) -> DiscoveryOutcome {
        let bar = self.stage_bar(variants.len() as u64, "Searching");
        let discoverer = Discoverer::new(
            self.search.clone(),
            self.config.search.clone(),
            self.config.max_concurrency,
        )
        .with_marketplaces(self.config.expansion.marketplaces.clone())
        .with_excluded_hosts(self.config.expansion.excluded_hosts.clone());

        let outcome = discoverer.discover(variants, guard).await;
        bar.finish_with_message(format!("Found {} candidates", outcome.candidates.len()));
        outcome
    }

    /// Extracts every candidate. Failed candidates become partial stub
    /// listings; interrupted ones are returned with the stop reason.
    async fn extract_all(
        &self,
        candidates: Vec<CandidateUrl>,
        guard: &RunGuard,
        summary: &mut RunSummary,
    ) -> Vec<(Listing, Option<Interrupted>)> {
        let bar = self.stage_bar(candidates.len() as u64, "Extracting listings");
        summary.extraction.attempted = candidates.len();
        let extractor = &self.extractor;

        let results = stream::iter(candidates)
            .map(|candidate| {
                let bar = bar.clone();
                async move {
                    let result = guard.run(extractor.extract(&candidate)).await;
                    bar.inc(1);
                    (candidate, result)
                }
            })
            .buffer_unordered(self.config.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut listings: Vec<(Listing, Option<Interrupted>)> = results
            .into_iter()
            .map(|(candidate, result)| match result {
                Ok(Ok(listing)) => {
                    summary.extraction.succeeded += 1;
                    (listing, None)
                }
                Ok(Err(e)) => {
                    warn!("Extraction failed for {}: {}", candidate.url, e);
                    summary.extraction.fail(e.kind());
                    (Listing::stub(&candidate, e.to_string()), None)
                }
                Err(reason) => {
                    summary.extraction.interrupted += 1;
                    (Listing::stub(&candidate, reason.to_string()), Some(reason))
                }
            })
            .collect();
        listings.sort_by_key(|(listing, _)| listing.discovery_index);

        bar.finish_with_message(format!("Extracted {} listings", summary.extraction.succeeded));
        listings
    }

    async fn classify_all(
        &self,
        query: &Query,
        listings: Vec<Listing>,
        guard: &RunGuard,
        summary: &mut RunSummary,
    ) -> Vec<(Listing, std::result::Result<Assessment, Interrupted>)> {
        let bar = self.stage_bar(listings.len() as u64, "Classifying listings");
        summary.classification.attempted = listings.len();

        let llm = &self.config.llm_config;
        let classifier = Classifier::new(self.scorer.clone(), self.config.classify_timeout, &llm.classifier_version)
            .with_context(query.context().unwrap_or(&llm.context));
        let classifier = &classifier;

        let results = stream::iter(listings)
            .map(|listing| {
                let bar = bar.clone();
                async move {
                    let result = guard.run(classifier.classify(&listing)).await;
                    bar.inc(1);
                    (listing, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_classifications)
            .collect::<Vec<_>>()
            .await;

        let mut classified: Vec<_> = results
            .into_iter()
            .map(|(listing, result)| {
                let assessment = match result {
                    Ok(Ok(result)) => {
                        summary.classification.succeeded += 1;
                        Ok(Assessment::Scored(result))
                    }
                    Ok(Err(e)) => {
                        warn!("Classification failed for {}: {}", listing.url, e);
                        summary.classification.fail(e.kind());
                        Ok(Assessment::Unscored { reason: e.to_string() })
                    }
                    Err(reason) => {
                        summary.classification.interrupted += 1;
                        Err(reason)
                    }
                };
                (listing, assessment)
            })
            .collect();
        classified.sort_by_key(|(listing, _)| listing.discovery_index);

        bar.finish_with_message(format!("Classified {} listings", summary.classification.succeeded));
        classified
    }

    fn stage_bar(&self, len: u64, message: &'static str) -> ProgressBar {
        let bar = self.progress.add(ProgressBar::new(len));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(message);
        bar
    }
}

/// Keywords requested from the enricher per wanted enrichment term.
const KEYWORDS_PER_TERM: usize = 5;

fn keyword_limit(terms: usize) -> usize {
    terms.saturating_mul(KEYWORDS_PER_TERM)
}

fn unscored(reason: Interrupted) -> Assessment {
    Assessment::Unscored {
        reason: reason.to_string(),
    }
}

/// A candidate the run stopped before reaching.
fn unreached(candidate: &CandidateUrl, reason: Interrupted) -> (Listing, Assessment) {
    (Listing::stub(candidate, reason.to_string()), unscored(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Expanding));
        assert!(Discovering.can_transition_to(Aggregating));
        assert!(Discovering.can_transition_to(Failed));
        assert!(!Extracting.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Expanding));
        assert!(!Classifying.can_transition_to(Extracting));
        assert!(Done.is_terminal() && Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_guard_passes_through_completed_work() {
        let guard = RunGuard::unbounded();
        assert_eq!(guard.run(async { 7 }).await, Ok(7));
        assert_eq!(guard.interrupted(), None);
    }

    #[tokio::test]
    async fn test_guard_cancellation_wins_over_completion() {
        let guard = RunGuard::unbounded();
        guard.cancel();
        assert_eq!(guard.run(async { 7 }).await, Err(Interrupted::Cancelled));
        assert_eq!(guard.interrupted(), Some(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_guard_deadline_interrupts_slow_work() {
        let guard = RunGuard::new(
            CancellationToken::new(),
            Some(Instant::now() + Duration::from_millis(20)),
        );
        let slow = tokio::time::sleep(Duration::from_secs(5));

        assert_eq!(guard.run(slow).await, Err(Interrupted::Deadline));
        assert_eq!(guard.interrupted(), Some(Interrupted::Deadline));
    }

    #[test]
    fn test_keyword_limit_saturates() {
        assert_eq!(keyword_limit(3), 15);
        assert_eq!(keyword_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_summary_records_deadline_as_budget() {
        let mut summary = RunSummary::default();
        summary.stop(Interrupted::Deadline, Duration::from_secs(1));
        summary.stop(Interrupted::Cancelled, Duration::from_secs(1));

        assert_eq!(summary.stopped_by, Some(Interrupted::Deadline));
        assert_eq!(
            summary.budget_exceeded,
            vec![BudgetExceeded::Duration { limit: Duration::from_secs(1) }]
        );
        assert!(!summary.cancelled());
    }
}
