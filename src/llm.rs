use crate::config::LLMConfig;
use crate::ClassificationError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// What a scoring service returns for one prompt, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawScore {
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

/// An external service that rates listing text.
#[async_trait]
pub trait ScoringService: Send + Sync {
    async fn score(&self, text: &str) -> Result<RawScore, ClassificationError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// The `LlmScorer` scores listings with an Ollama-compatible `/api/generate` endpoint.
pub struct LlmScorer {
    client: Client,
    config: LLMConfig,
}

impl LlmScorer {
    pub fn new(config: LLMConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ScoringService for LlmScorer {
    async fn score(&self, text: &str) -> Result<RawScore, ClassificationError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: text,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        debug!("Sending {} prompt characters to {}", text.len(), self.config.model);
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassificationError::Timeout
                } else {
                    ClassificationError::Service(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Scoring service answered {}: {}", status, body);
            return Err(ClassificationError::Service(format!("HTTP status {status}")));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ClassificationError::InvalidResponse(e.to_string()))?;
        parse_score(&generated.response)
    }
}

/// Reads a `{"score": .., "rationale": ..}` object, ignoring any prose the
/// model wrapped around it.
pub fn parse_score(text: &str) -> Result<RawScore, ClassificationError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(ClassificationError::InvalidResponse(format!(
                "no JSON object in response: {}",
                text.chars().take(120).collect::<String>()
            )))
        }
    };

    #[derive(Deserialize)]
    struct Loose {
        score: serde_json::Value,
        #[serde(default)]
        rationale: Option<String>,
    }

    let loose: Loose =
        serde_json::from_str(json).map_err(|e| ClassificationError::InvalidResponse(e.to_string()))?;
    let score = match &loose.score {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ClassificationError::InvalidResponse(format!("score is not a number: {}", loose.score)))?;

    Ok(RawScore {
        score,
        rationale: loose.rationale.unwrap_or_default(),
    })
}
