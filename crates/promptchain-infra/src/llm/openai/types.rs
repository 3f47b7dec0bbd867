//! OpenAI API wire types.
//!
//! These are OpenAI-specific request/response structures for HTTP
//! communication with the chat completions, files, and batches endpoints.
//! They are NOT the provider-agnostic types from `promptchain-types`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Effort hint for reasoning-capable models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Response body for a non-streaming chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One line of a batch input JSONL file.
#[derive(Debug, Clone, Serialize)]
pub struct BatchInputLine {
    pub custom_id: String,
    pub method: &'static str,
    pub url: &'static str,
    pub body: ChatRequest,
}

/// Response body for `POST /v1/files`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
}

/// Response body for `POST /v1/batches` and `GET /v1/batches/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: Option<BatchRequestCounts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// One line of a batch output/error JSONL file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputLine {
    pub custom_id: String,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub response: Option<BatchLineResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchLineResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Error envelope returned by the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_omits_absent_options() {
        let request = ChatRequest {
            model: "gpt-5".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            temperature: None,
            reasoning_effort: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("temperature").is_none());
        assert!(value.get("reasoning_effort").is_none());
    }

    #[test]
    fn chat_response_parses_minimal_payload() {
        let payload = json!({
            "id": "chatcmpl-1",
            "model": "gpt-5",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]
        });
        let response: ChatResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("hello"));
    }

    #[test]
    fn batch_output_line_parses_error_and_success() {
        let ok: BatchOutputLine = serde_json::from_str(
            r#"{"custom_id": "item_a", "response": {"status_code": 200, "body": {"choices": []}}}"#,
        )
        .unwrap();
        assert!(ok.error.is_none());
        assert_eq!(ok.response.unwrap().status_code, Some(200));

        let failed: BatchOutputLine = serde_json::from_str(
            r#"{"custom_id": "item_b", "error": {"message": "boom"}}"#,
        )
        .unwrap();
        assert!(failed.error.is_some());
    }
}
