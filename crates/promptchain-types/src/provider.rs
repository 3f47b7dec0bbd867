//! Provider-agnostic request/response types and the provider error taxonomy.
//!
//! These model the two capability surfaces the engine consumes: synchronous
//! completion, and the asynchronous batch lifecycle (submit / poll / fetch).
//! Concrete adapters live in `promptchain-infra`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::ReasoningConfig;

/// Request for a single synchronous completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

/// Response from a synchronous completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Raw response text, exactly as the provider returned it.
    pub text: String,
    /// Provider-specific metadata (model echo, usage counters, request id).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One entry in a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Deterministic item id; doubles as the provider-side custom id.
    pub item_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

/// Handle returned by a successful batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHandle {
    /// Provider-assigned submission id.
    pub submission_id: String,
    /// `item_id` -> provider request id.
    pub mapping: BTreeMap<String, String>,
}

/// Lifecycle status of a submitted batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl BatchJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchJobStatus::Submitted => "submitted",
            BatchJobStatus::Running => "running",
            BatchJobStatus::Completed => "completed",
            BatchJobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchJobStatus::Completed | BatchJobStatus::Failed)
    }
}

impl fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll observation of a batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPollReport {
    pub status: BatchJobStatus,
    /// Per-state request counts as reported by the provider
    /// (e.g. `{"completed": 3, "failed": 1}`).
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

/// Per-item result of a completed batch, as returned by `fetch`.
#[derive(Debug)]
pub struct BatchItemOutcome {
    pub item_id: String,
    pub outcome: Result<String, ProviderError>,
}

/// Errors from provider operations, classified so the engine can record the
/// class without retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("provider internal error: {0}")]
    ProviderInternal(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Stable lowercase token recorded in `stage.json` and `run.log`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::Network(_) => "network",
            ProviderError::RateLimit(_) => "rate_limit",
            ProviderError::ModelUnavailable(_) => "model_unavailable",
            ProviderError::ProviderInternal(_) => "provider_internal",
            ProviderError::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_kind_tokens() {
        let cases: Vec<(ProviderError, &str)> = vec![
            (ProviderError::Auth("k".into()), "auth"),
            (ProviderError::Network("n".into()), "network"),
            (ProviderError::RateLimit("r".into()), "rate_limit"),
            (
                ProviderError::ModelUnavailable("m".into()),
                "model_unavailable",
            ),
            (
                ProviderError::ProviderInternal("p".into()),
                "provider_internal",
            ),
            (ProviderError::InvalidRequest("i".into()), "invalid_request"),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn batch_status_terminality() {
        assert!(!BatchJobStatus::Submitted.is_terminal());
        assert!(!BatchJobStatus::Running.is_terminal());
        assert!(BatchJobStatus::Completed.is_terminal());
        assert!(BatchJobStatus::Failed.is_terminal());
    }

    #[test]
    fn batch_status_serde_tokens() {
        let json = serde_json::to_string(&BatchJobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: BatchJobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, BatchJobStatus::Completed);
    }
}
