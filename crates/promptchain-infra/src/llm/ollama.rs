//! Local Ollama provider (sync completion only).
//!
//! Talks to the Ollama HTTP API (`POST /api/generate`) with streaming
//! disabled, so the full response arrives in one body. The base URL
//! defaults to `http://localhost:11434` and can be overridden for tests or
//! remote hosts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use promptchain_core::provider::CompletionProvider;
use promptchain_types::provider::{CompletionRequest, CompletionResponse, ProviderError};

/// Default local Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama provider. Implements sync completion only; Ollama has no batch
/// API.
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to create reqwest client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Provider pointed at the default local endpoint.
    pub fn local() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    model: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: request
                .temperature
                .map(|temperature| GenerateOptions { temperature }),
        };

        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Network(format!(
                    "failed to reach Ollama at {}: {e}. Is the Ollama server running?",
                    self.base_url
                ))
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("failed to read Ollama response: {e}")))?;

        if !status.is_success() {
            if status.as_u16() == 404 || text.contains("not found") {
                return Err(ProviderError::ModelUnavailable(format!(
                    "model '{}' is not available on the Ollama server: {text}",
                    request.model
                )));
            }
            if status.is_server_error() {
                return Err(ProviderError::ProviderInternal(text));
            }
            return Err(ProviderError::InvalidRequest(text));
        }

        let payload: GenerateResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::ProviderInternal(format!("Ollama response was not valid JSON: {e}"))
        })?;
        let content = payload.response.ok_or_else(|| {
            ProviderError::ProviderInternal(
                "Ollama response missing 'response' field".to_string(),
            )
        })?;

        Ok(CompletionResponse {
            text: content,
            metadata: serde_json::json!({
                "model": payload.model,
                "done": payload.done,
                "eval_count": payload.eval_count,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let provider = OllamaProvider::new("http://example.com:11434/");
        assert_eq!(provider.url("/api/generate"), "http://example.com:11434/api/generate");
    }

    #[test]
    fn local_uses_default_endpoint() {
        let provider = OllamaProvider::local();
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn unreachable_server_maps_to_network_error() {
        // Nothing listens on this port.
        let provider = OllamaProvider::new("http://127.0.0.1:1");
        let err = provider
            .complete(&CompletionRequest {
                model: "llama3".into(),
                prompt: "hi".into(),
                temperature: None,
                reasoning: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)));
        assert!(err.to_string().contains("Is the Ollama server running?"));
    }
}
