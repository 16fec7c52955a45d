//! Text-generation provider abstraction.
//!
//! Defines the [`GenerationProvider`] capability trait consumed by the
//! answer synthesizer, the content-safety configuration passed with every
//! request, and the [`GeminiGenerator`] REST implementation. A provider
//! may refuse to answer under its safety policy; refusals are a normal
//! [`Reply`] variant, not an error.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::{PipelineError, Result};

/// One harm category and its blocking threshold.
#[derive(Debug, Clone)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

/// Content-safety policy forwarded to the provider.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub settings: Vec<SafetySetting>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let categories = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ];
        Self {
            settings: categories
                .into_iter()
                .map(|category| SafetySetting {
                    category,
                    threshold: "BLOCK_MEDIUM_AND_ABOVE",
                })
                .collect(),
        }
    }
}

/// Outcome of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// The provider declined under its safety policy.
    Refusal,
}

/// Capability interface for text-generation backends.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str, safety: &SafetyConfig) -> Result<Reply>;
}

/// Generation provider for the Gemini `generateContent` REST endpoint.
///
/// Requires the `GEMINI_API_KEY` environment variable at construction.
pub struct GeminiGenerator {
    model: String,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
    config: GenerationConfig,
}

impl GeminiGenerator {
    pub fn from_env(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            PipelineError::validation("GEMINI_API_KEY environment variable not set")
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::GenerationProvider {
                message: e.to_string(),
                transient: false,
            })?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl GenerationProvider for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, safety: &SafetyConfig) -> Result<Reply> {
        let safety_settings: Vec<serde_json::Value> = safety
            .settings
            .iter()
            .map(|s| {
                serde_json::json!({
                    "category": s.category,
                    "threshold": s.threshold,
                })
            })
            .collect();

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "safetySettings": safety_settings,
            "generationConfig": {
                "temperature": self.config.temperature,
                "topP": self.config.top_p,
                "topK": self.config.top_k,
                "maxOutputTokens": self.config.max_output_tokens,
                "candidateCount": 1,
            },
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::GenerationProvider {
                message: format!("request failed: {}", e),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let transient = status.as_u16() == 429 || status.is_server_error();
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::GenerationProvider {
                message: format!("API error {}: {}", status, body_text),
                transient,
            });
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| PipelineError::GenerationProvider {
                    message: format!("invalid response body: {}", e),
                    transient: false,
                })?;

        parse_generate_response(&json)
    }
}

/// Parse a `generateContent` response into a [`Reply`].
///
/// A `SAFETY` finish reason (or a prompt-feedback block) maps to
/// [`Reply::Refusal`]; anything without candidate text is an error.
fn parse_generate_response(json: &serde_json::Value) -> Result<Reply> {
    if json
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .is_some()
    {
        return Ok(Reply::Refusal);
    }

    let candidate = json
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| PipelineError::GenerationProvider {
            message: "invalid response: no candidates".to_string(),
            transient: false,
        })?;

    if candidate.get("finishReason").and_then(|r| r.as_str()) == Some("SAFETY") {
        return Ok(Reply::Refusal);
    }

    let text = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(PipelineError::GenerationProvider {
            message: "invalid response: empty candidate text".to_string(),
            transient: true,
        });
    }

    Ok(Reply::Text(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_safety_covers_four_categories() {
        let safety = SafetyConfig::default();
        assert_eq!(safety.settings.len(), 4);
        assert!(safety
            .settings
            .iter()
            .all(|s| s.threshold == "BLOCK_MEDIUM_AND_ABOVE"));
    }

    #[test]
    fn parse_text_candidate() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "An answer." }] },
                "finishReason": "STOP",
            }]
        });
        assert_eq!(
            parse_generate_response(&json).unwrap(),
            Reply::Text("An answer.".to_string())
        );
    }

    #[test]
    fn safety_finish_reason_is_a_refusal() {
        let json = serde_json::json!({
            "candidates": [{ "finishReason": "SAFETY" }]
        });
        assert_eq!(parse_generate_response(&json).unwrap(), Reply::Refusal);
    }

    #[test]
    fn blocked_prompt_is_a_refusal() {
        let json = serde_json::json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        });
        assert_eq!(parse_generate_response(&json).unwrap(), Reply::Refusal);
    }

    #[test]
    fn missing_candidates_is_an_error() {
        let json = serde_json::json!({ "candidates": [] });
        assert!(parse_generate_response(&json).is_err());
    }
}
