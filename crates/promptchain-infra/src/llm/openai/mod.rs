//! OpenAI provider: sync chat completions plus the batch lifecycle.
//!
//! Sync completion goes through `POST /v1/chat/completions`. The batch
//! capability uploads a JSONL request file (`POST /v1/files`, purpose
//! `batch`), creates a batch job against the chat completions endpoint
//! with a 24h completion window, polls `GET /v1/batches/{id}`, and
//! downloads per-item results from the output/error files.
//!
//! The API key is wrapped in [`secrecy::SecretString`] and only exposed
//! when constructing request headers; the provider does not derive `Debug`.

pub mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use promptchain_core::provider::{BatchProvider, CompletionProvider};
use promptchain_types::provider::{
    BatchHandle, BatchItemOutcome, BatchJobStatus, BatchPollReport, BatchRequest,
    CompletionRequest, CompletionResponse, ProviderError,
};

use self::types::{
    ApiErrorEnvelope, BatchInputLine, BatchObject, BatchOutputLine, ChatMessage, ChatRequest,
    ChatResponse, FileObject,
};

/// Default OpenAI API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

/// OpenAI provider implementing both capability surfaces.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to create reqwest client");
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Override the base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn chat_request(&self, request: &CompletionRequest) -> ChatRequest {
        ChatRequest {
            model: request.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            temperature: request.temperature,
            reasoning_effort: request.reasoning.as_ref().map(|r| r.effort.clone()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(map_transport_error)?;
        read_json(response).await
    }

    async fn download_file(&self, file_id: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        Ok(text)
    }

    async fn retrieve_batch(&self, submission_id: &str) -> Result<BatchObject, ProviderError> {
        self.get_json(&format!("/v1/batches/{submission_id}")).await
    }
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = self.chat_request(request);
        let response = self
            .client
            .post(self.url(CHAT_COMPLETIONS_PATH))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let payload: ChatResponse = read_json(response).await?;

        let text = payload
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                ProviderError::ProviderInternal(
                    "chat completion returned no message content".to_string(),
                )
            })?;

        Ok(CompletionResponse {
            text,
            metadata: serde_json::json!({
                "id": payload.id,
                "model": payload.model,
                "finish_reason": payload.choices.first().and_then(|c| c.finish_reason.clone()),
                "usage": payload.usage,
            }),
        })
    }
}

impl BatchProvider for OpenAiProvider {
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<BatchHandle, ProviderError> {
        // Build the JSONL input file; the custom id is the item id, which
        // keys everything downstream.
        let mut jsonl = String::new();
        let mut mapping = BTreeMap::new();
        for request in &requests {
            let line = BatchInputLine {
                custom_id: request.item_id.clone(),
                method: "POST",
                url: CHAT_COMPLETIONS_PATH,
                body: ChatRequest {
                    model: request.model.clone(),
                    messages: vec![ChatMessage {
                        role: "user".to_string(),
                        content: request.prompt.clone(),
                    }],
                    temperature: request.temperature,
                    reasoning_effort: request.reasoning.as_ref().map(|r| r.effort.clone()),
                },
            };
            jsonl.push_str(&serde_json::to_string(&line).map_err(|e| {
                ProviderError::InvalidRequest(format!("failed to encode batch line: {e}"))
            })?);
            jsonl.push('\n');
            mapping.insert(request.item_id.clone(), request.item_id.clone());
        }

        let part = reqwest::multipart::Part::text(jsonl)
            .file_name("batch_input.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);
        let response = self
            .client
            .post(self.url("/v1/files"))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;
        let file: FileObject = read_json(response).await?;

        let response = self
            .client
            .post(self.url("/v1/batches"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "input_file_id": file.id,
                "endpoint": CHAT_COMPLETIONS_PATH,
                "completion_window": COMPLETION_WINDOW,
            }))
            .send()
            .await
            .map_err(map_transport_error)?;
        let batch: BatchObject = read_json(response).await?;

        tracing::info!(
            submission_id = batch.id.as_str(),
            requests = mapping.len(),
            "submitted OpenAI batch"
        );
        Ok(BatchHandle {
            submission_id: batch.id,
            mapping,
        })
    }

    async fn poll(&self, submission_id: &str) -> Result<BatchPollReport, ProviderError> {
        let batch = self.retrieve_batch(submission_id).await?;
        let status = map_batch_status(&batch.status);
        let mut counts = BTreeMap::new();
        if let Some(rc) = batch.request_counts {
            counts.insert("total".to_string(), rc.total);
            counts.insert("completed".to_string(), rc.completed);
            counts.insert("failed".to_string(), rc.failed);
        }
        Ok(BatchPollReport { status, counts })
    }

    async fn fetch(&self, submission_id: &str) -> Result<Vec<BatchItemOutcome>, ProviderError> {
        let batch = self.retrieve_batch(submission_id).await?;
        let mut outcomes = Vec::new();

        if let Some(output_file_id) = &batch.output_file_id {
            let content = self.download_file(output_file_id).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                outcomes.push(parse_output_line(line)?);
            }
        }
        if let Some(error_file_id) = &batch.error_file_id {
            let content = self.download_file(error_file_id).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                outcomes.push(parse_output_line(line)?);
            }
        }

        Ok(outcomes)
    }
}

/// Parse one result line into a per-item outcome.
fn parse_output_line(line: &str) -> Result<BatchItemOutcome, ProviderError> {
    let parsed: BatchOutputLine = serde_json::from_str(line).map_err(|e| {
        ProviderError::ProviderInternal(format!("batch result line was not valid JSON: {e}"))
    })?;

    if let Some(error) = parsed.error {
        return Ok(BatchItemOutcome {
            item_id: parsed.custom_id,
            outcome: Err(ProviderError::ProviderInternal(error.to_string())),
        });
    }

    let response = match parsed.response {
        Some(response) => response,
        None => {
            return Ok(BatchItemOutcome {
                item_id: parsed.custom_id,
                outcome: Err(ProviderError::ProviderInternal(
                    "batch result line carried neither response nor error".to_string(),
                )),
            });
        }
    };

    let status_code = response.status_code.unwrap_or(0);
    if status_code != 200 {
        let detail = response
            .body
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        return Ok(BatchItemOutcome {
            item_id: parsed.custom_id,
            outcome: Err(classify_status(status_code, &detail)),
        });
    }

    let outcome = match response.body.as_ref().and_then(extract_chat_text) {
        Some(text) => Ok(text),
        None => Err(ProviderError::ProviderInternal(
            "batch result body contained no message content".to_string(),
        )),
    };
    Ok(BatchItemOutcome {
        item_id: parsed.custom_id,
        outcome,
    })
}

/// Pull the message text out of a chat-completions response body.
fn extract_chat_text(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

fn map_batch_status(status: &str) -> BatchJobStatus {
    match status {
        "completed" => BatchJobStatus::Completed,
        "failed" | "expired" | "cancelled" | "cancelling" => BatchJobStatus::Failed,
        "validating" => BatchJobStatus::Submitted,
        // in_progress, finalizing, and anything new the API grows
        _ => BatchJobStatus::Running,
    }
}

fn map_transport_error(error: reqwest::Error) -> ProviderError {
    if let Some(status) = error.status() {
        return classify_status(status.as_u16(), &error.to_string());
    }
    ProviderError::Network(error.to_string())
}

/// Classify an HTTP failure into the engine's error taxonomy.
fn classify_status(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::RateLimit(message),
        404 => ProviderError::ModelUnavailable(message),
        400..=499 => {
            if message.contains("model") && message.contains("not") {
                ProviderError::ModelUnavailable(message)
            } else {
                ProviderError::InvalidRequest(message)
            }
        }
        _ => ProviderError::ProviderInternal(message),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let text = response.text().await.map_err(map_transport_error)?;
    if !status.is_success() {
        return Err(classify_status(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|e| {
        ProviderError::ProviderInternal(format!("failed to parse OpenAI response: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(401, "denied"), ProviderError::Auth(_)));
        assert!(matches!(classify_status(403, "denied"), ProviderError::Auth(_)));
        assert!(matches!(
            classify_status(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            classify_status(404, "no such model"),
            ProviderError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_status(400, "bad"),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(500, "boom"),
            ProviderError::ProviderInternal(_)
        ));
    }

    #[test]
    fn status_classification_reads_error_envelope() {
        let body = r#"{"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}}"#;
        let err = classify_status(401, body);
        assert!(err.to_string().contains("Incorrect API key provided"));
    }

    #[test]
    fn batch_status_mapping() {
        assert_eq!(map_batch_status("completed"), BatchJobStatus::Completed);
        assert_eq!(map_batch_status("failed"), BatchJobStatus::Failed);
        assert_eq!(map_batch_status("expired"), BatchJobStatus::Failed);
        assert_eq!(map_batch_status("validating"), BatchJobStatus::Submitted);
        assert_eq!(map_batch_status("in_progress"), BatchJobStatus::Running);
        assert_eq!(map_batch_status("finalizing"), BatchJobStatus::Running);
    }

    #[test]
    fn output_line_success_extracts_text() {
        let line = r#"{"custom_id": "item_a", "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "hello"}}]}}}"#;
        let outcome = parse_output_line(line).unwrap();
        assert_eq!(outcome.item_id, "item_a");
        assert_eq!(outcome.outcome.unwrap(), "hello");
    }

    #[test]
    fn output_line_error_is_per_item() {
        let line = r#"{"custom_id": "item_b", "error": {"message": "boom"}}"#;
        let outcome = parse_output_line(line).unwrap();
        assert_eq!(outcome.item_id, "item_b");
        assert!(outcome.outcome.is_err());
    }

    #[test]
    fn output_line_non_200_classifies_status() {
        let line = r#"{"custom_id": "item_c", "response": {"status_code": 429, "body": {"error": {"message": "rate limited"}}}}"#;
        let outcome = parse_output_line(line).unwrap();
        assert!(matches!(
            outcome.outcome.unwrap_err(),
            ProviderError::RateLimit(_)
        ));
    }

    #[test]
    fn extract_chat_text_reads_first_choice() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "first"}}, {"message": {"content": "second"}}]
        });
        assert_eq!(extract_chat_text(&body).as_deref(), Some("first"));
        assert_eq!(extract_chat_text(&serde_json::json!({})), None);
    }
}
