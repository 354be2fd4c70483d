use crate::llm::ScoringService;
use crate::prompt::PromptBuilder;
use crate::types::{ClassificationResult, Listing};
use crate::ClassificationError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// The `Classifier` asks a scoring service how likely a listing is fraudulent.
pub struct Classifier {
    service: Arc<dyn ScoringService>,
    timeout: Duration,
    version: String,
    context: String,
}

impl Classifier {
    pub fn new(service: Arc<dyn ScoringService>, timeout: Duration, version: impl Into<String>) -> Self {
        Self {
            service,
            timeout,
            version: version.into(),
            context: String::new(),
        }
    }

    /// Sets the description of what counts as suspicious.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Scores one listing. A call that outlives the timeout fails with
    /// `ClassificationError::Timeout`.
    #[instrument(skip(self, listing), fields(url = %listing.url))]
    pub async fn classify(&self, listing: &Listing) -> Result<ClassificationResult, ClassificationError> {
        let prompt = PromptBuilder::new(self.context.as_str(), listing).build();

        let raw = tokio::time::timeout(self.timeout, self.service.score(&prompt))
            .await
            .map_err(|_| ClassificationError::Timeout)??;

        if !raw.score.is_finite() || !(0.0..=1.0).contains(&raw.score) {
            return Err(ClassificationError::InvalidResponse(format!(
                "score {} outside [0, 1]",
                raw.score
            )));
        }

        debug!("Scored {:.2}", raw.score);
        Ok(ClassificationResult {
            listing_url: listing.url.clone(),
            score: raw.score,
            rationale: raw.rationale,
            classifier_version: self.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RawScore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use url::Url;

    struct FixedScore {
        score: f64,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedScore {
        fn new(score: f64) -> Self {
            Self {
                score,
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScoringService for FixedScore {
        async fn score(&self, text: &str) -> Result<RawScore, ClassificationError> {
            self.prompts.lock().unwrap().push(text.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(RawScore {
                score: self.score,
                rationale: "looks like a replica".into(),
            })
        }
    }

    fn listing() -> Listing {
        Listing {
            url: Url::parse("https://shop.example.ch/1").unwrap(),
            title: Some("Rolex".into()),
            price: Some(50.0),
            currency: Some("CHF".into()),
            seller_identifier: None,
            description: None,
            images: Vec::new(),
            raw_snapshot: String::new(),
            partial: true,
            discovery_index: 0,
            marketplace: None,
            snippet: None,
            sources: Vec::new(),
            extraction_error: None,
        }
    }

    #[tokio::test]
    async fn test_classify_builds_result() {
        let service = Arc::new(FixedScore::new(0.75));
        let classifier = Classifier::new(service.clone(), Duration::from_secs(1), "test-v1")
            .with_context("counterfeit watches");

        let result = classifier.classify(&listing()).await.unwrap();

        assert_eq!(result.score, 0.75);
        assert_eq!(result.classifier_version, "test-v1");
        assert_eq!(result.listing_url.as_str(), "https://shop.example.ch/1");
        let prompts = service.prompts.lock().unwrap();
        assert!(prompts[0].contains("Context: counterfeit watches"));
        assert!(prompts[0].contains("Title: Rolex"));
    }

    #[tokio::test]
    async fn test_out_of_range_scores_are_rejected() {
        for score in [1.5, -0.1, f64::NAN] {
            let classifier = Classifier::new(Arc::new(FixedScore::new(score)), Duration::from_secs(1), "v");
            assert!(matches!(
                classifier.classify(&listing()).await,
                Err(ClassificationError::InvalidResponse(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let service = FixedScore {
            delay: Duration::from_millis(500),
            ..FixedScore::new(0.5)
        };
        let classifier = Classifier::new(Arc::new(service), Duration::from_millis(20), "v");

        assert_eq!(
            classifier.classify(&listing()).await.unwrap_err(),
            ClassificationError::Timeout
        );
    }
}
