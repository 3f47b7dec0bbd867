//! Run, stage, and item metadata records.
//!
//! Everything in this module is persisted inside a run directory:
//! `run.json`, per-stage `stage.json` / `<stage_id>.meta.json`, per-item
//! `stage.json`, the map manifest (`output.json`), and the batch state file
//! (`support/stages/<id>/batch.json`). The directory layout itself is owned
//! by `promptchain-core::store`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::ReasoningConfig;
use crate::provider::BatchJobStatus;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Run-level status recorded in `run.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    CompletedWithErrors,
    Stopped,
    Failed,
    BatchPending,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
            RunStatus::BatchPending => "batch_pending",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-level status recorded in `stage.json` and `<stage_id>.meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    CompletedWithErrors,
    Failed,
    Skipped,
    AwaitingBatch,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Started => "started",
            StageStatus::Completed => "completed",
            StageStatus::CompletedWithErrors => "completed_with_errors",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::AwaitingBatch => "awaiting_batch",
        }
    }

    /// Whether this status counts as a successful terminal state.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::CompletedWithErrors | StageStatus::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        StageStatus::Started
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(StageStatus::Started),
            "completed" => Ok(StageStatus::Completed),
            "completed_with_errors" => Ok(StageStatus::CompletedWithErrors),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            "awaiting_batch" => Ok(StageStatus::AwaitingBatch),
            other => Err(format!("invalid stage status: '{other}'")),
        }
    }
}

/// Per-item status within a map stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Shell written, provider batch submission pending or in flight.
    SubmittedPending,
    /// Selected for execution in the current invocation.
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::SubmittedPending => "submitted_pending",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run metadata
// ---------------------------------------------------------------------------

/// Top-level run record (`run.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub pipeline: String,
    pub pipeline_provider: String,
    pub pipeline_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_reasoning: Option<ReasoningConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_path: Option<String>,
    /// User parameters bound into every stage's context.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    pub started_at: String,
    pub status: RunStatus,
    /// Per-stage summaries, keyed by stage id.
    #[serde(default)]
    pub stages: BTreeMap<String, StageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_pending_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Publish record written after a successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PublishRecord>,
}

/// Per-stage summary inside `run.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSummary {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
}

/// Record of the publish pass inside `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub published_at: String,
    /// Run-root-relative path of the publish directory (always `output`).
    pub path: String,
    pub artifacts: Vec<PublishedArtifact>,
}

/// One published deliverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedArtifact {
    pub stage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Run-root-relative destination path.
    pub output_path: String,
}

// ---------------------------------------------------------------------------
// Stage metadata
// ---------------------------------------------------------------------------

/// Full stage record (`stages/<id>/stage.json`, mirrored to
/// `<id>.meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMeta {
    pub stage_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    pub enabled: bool,
    /// Output kind token ("markdown" | "json" | "both").
    pub output: String,
    /// Stage kind token ("single" | "map").
    pub kind: String,
    pub publish: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    /// Fully rendered prompt (single stages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Context field expressions the template referenced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_fields: Vec<String>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Error kind token on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Producer stage id for disabled-dependency failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<String>,
}

/// Per-item record (`stages/<id>/items/<item_id>/stage.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    pub stage_id: String,
    pub item_id: String,
    pub item_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Map manifest
// ---------------------------------------------------------------------------

/// Map-stage manifest (`stages/<id>/output.json`). Item order always equals
/// source order; the file is rewritten atomically on every item transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub items: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_source: Option<String>,
}

/// One item's row in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub item_id: String,
    #[serde(rename = "_selected")]
    pub selected: bool,
    pub status: ItemStatus,
    /// The normalized item value.
    pub item: Value,
    /// Run-root-relative path of the item's output artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Run-root-relative path of the item's raw response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Batch state
// ---------------------------------------------------------------------------

/// Batch-mode state file (`support/stages/<id>/batch.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub submission_id: String,
    pub submitted_at: String,
    /// `item_id` -> provider request id.
    pub mapping: BTreeMap<String, String>,
    /// Every poll observation, appended in order.
    #[serde(default)]
    pub polls: Vec<PollSnapshot>,
}

/// One appended poll observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub at: String,
    pub status: BatchJobStatus,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_status_roundtrip() {
        for status in [
            StageStatus::Started,
            StageStatus::Completed,
            StageStatus::CompletedWithErrors,
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::AwaitingBatch,
        ] {
            let s = status.to_string();
            let parsed: StageStatus = s.parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn stage_status_success_classification() {
        assert!(StageStatus::Completed.is_success());
        assert!(StageStatus::CompletedWithErrors.is_success());
        assert!(StageStatus::Skipped.is_success());
        assert!(!StageStatus::Failed.is_success());
        assert!(!StageStatus::Started.is_success());
        assert!(!StageStatus::AwaitingBatch.is_success());
    }

    #[test]
    fn manifest_entry_serde_uses_selected_marker() {
        let entry = ManifestEntry {
            item_id: "item_0011223344556677".into(),
            selected: true,
            status: ItemStatus::Completed,
            item: json!({"value": "alpha"}),
            output_path: Some("stages/expand/items/item_0011223344556677/output.md".into()),
            raw_path: Some("stages/expand/items/item_0011223344556677/raw.txt".into()),
            error: None,
            error_path: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["_selected"], json!(true));
        assert_eq!(value["status"], json!("completed"));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn run_meta_minimal_roundtrip() {
        let meta = RunMeta {
            run_id: "20260101T000000Z_deadbeef".into(),
            pipeline: "demo".into(),
            pipeline_provider: "ollama".into(),
            pipeline_model: "llama3".into(),
            pipeline_temperature: None,
            pipeline_reasoning: None,
            pipeline_path: Some("demo.yaml".into()),
            params: BTreeMap::from([("topic".to_string(), json!("chess"))]),
            started_at: "2026-01-01T00:00:00Z".into(),
            status: RunStatus::Started,
            stages: BTreeMap::new(),
            completed_at: None,
            stopped_at: None,
            failed_at: None,
            batch_pending_at: None,
            error: None,
            output: None,
        };
        let text = serde_json::to_string_pretty(&meta).unwrap();
        let restored: RunMeta = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.run_id, meta.run_id);
        assert_eq!(restored.params["topic"], json!("chess"));
        assert_eq!(restored.status, RunStatus::Started);
    }

    #[test]
    fn batch_state_roundtrip_with_polls() {
        let state = BatchState {
            submission_id: "batch_abc".into(),
            submitted_at: "2026-01-01T00:00:00Z".into(),
            mapping: BTreeMap::from([(
                "item_0011223344556677".to_string(),
                "req_1".to_string(),
            )]),
            polls: vec![PollSnapshot {
                at: "2026-01-01T00:01:00Z".into(),
                status: BatchJobStatus::Running,
                counts: BTreeMap::from([("completed".to_string(), 1)]),
            }],
        };
        let text = serde_json::to_string(&state).unwrap();
        let restored: BatchState = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.polls.len(), 1);
        assert_eq!(restored.polls[0].status, BatchJobStatus::Running);
        assert_eq!(restored.mapping["item_0011223344556677"], "req_1");
    }
}
