use anyhow::Context;
use fraudcrawler::{CrawlerConfig, Pipeline, Query};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// The main entry point of the application.
///
/// Usage: `fraudcrawler <search term> [context] [enrichment terms]`.
/// Settings come from the TOML file named by `FRAUDCRAWLER_CONFIG`, if set,
/// and from `FRAUDCRAWLER__*` environment variables.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config_path = std::env::var_os("FRAUDCRAWLER_CONFIG").map(PathBuf::from);
    let config = CrawlerConfig::load(config_path.as_deref()).context("loading configuration")?;

    let search_term = std::env::args()
        .nth(1)
        .context("usage: fraudcrawler <search term> [context] [enrichment terms]")?;

    let mut query = Query::new(search_term);
    if let Some(context) = std::env::args().nth(2) {
        query = query.with_context(context);
    }
    if let Some(terms) = std::env::args().nth(3) {
        let terms: usize = terms.parse().context("enrichment terms must be a number")?;
        query = query.with_enrichment_terms(terms);
    }

    let pipeline = Pipeline::new(config)?;

    // Ctrl-C stops the run; whatever was collected is still reported.
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with partial results");
            on_interrupt.cancel();
        }
    });

    let outcome = match pipeline.run_with_cancellation(query.clone(), token).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Run for '{}' failed: {}", query.text(), e);
            return Err(e.into());
        }
    };

    let summary = &outcome.summary;
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    println!("\n=== Run Summary ===");
    println!("Search term: {}", query.text());
    println!("Search queries: {}", summary.variants);
    println!(
        "Candidates: {} ({} duplicates, {} filtered, {} over budget)",
        summary.candidates, summary.duplicates, summary.filtered, summary.dropped_by_budget
    );
    println!(
        "Extracted: {}/{} ({} failed)",
        summary.extraction.succeeded,
        summary.extraction.attempted,
        summary.extraction.failed_total()
    );
    println!(
        "Scored: {} ({} unscored)",
        outcome.report.scored_count(),
        outcome.report.unscored_count()
    );
    if let Some(reason) = summary.stopped_by {
        println!("Stopped early: {}", reason);
    }
    println!("Processing time: {:.2?}", summary.elapsed);

    Ok(())
}
