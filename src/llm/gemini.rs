//! Gemini `generateContent` client: the thin production implementation of
//! `CompletionBackend`.

use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::llm::CompletionBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Hosted completion backend over HTTPS. One request per completion, with a
/// bounded timeout; the caller never retries beyond its own quality gates.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_output_tokens: Option<u32>,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[async_trait]
impl CompletionBackend for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingKey)?;
        let url = format!("{API_BASE}/{}:generateContent?key={api_key}", self.model);

        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        let candidate = payload
            .candidates
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyCandidates)?;
        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::EmptyText);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_token_cap_when_unset() {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: "hi" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.9,
                max_output_tokens: None,
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"generationConfig\""));
        assert!(!json.contains("maxOutputTokens"));

        let capped = GenerateRequest {
            contents: Vec::new(),
            generation_config: GenerationConfig {
                temperature: 0.9,
                max_output_tokens: Some(512),
            },
        };
        let json = serde_json::to_string(&capped).unwrap();
        assert!(json.contains("\"maxOutputTokens\":512"));
    }

    #[test]
    fn response_parsing_joins_candidate_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"하나"},{"text":"둘"}]}}]}"#;
        let payload: GenerateResponse = serde_json::from_str(raw).unwrap();
        let text: String = payload.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .map(|part| part.text.clone())
            .collect();
        assert_eq!(text, "하나둘");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let client = GeminiClient::new(&LlmConfig {
            api_key: None,
            model: "gemini-2.5-flash".into(),
            temperature: 0.9,
            max_output_tokens: None,
            timeout_secs: 20,
        })
        .unwrap();
        let err = client.complete("hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingKey));
    }
}
