//! The execution engine: stage executor, map scheduler, and runner.
//!
//! The [`runner`] resolves which stages to execute and drives them in
//! pipeline order; the [`executor`] runs a single stage end to end; the
//! [`scheduler`] fans a map stage out across its items in concurrent or
//! batch mode. All three write artifacts exclusively through the
//! [`crate::store::ArtifactStore`].

pub mod executor;
pub mod runner;
pub mod scheduler;

use promptchain_types::pipeline::{OutputKind, Pipeline, Stage, StageKind};
use promptchain_types::run::{StageMeta, StageStatus, StageSummary};

use crate::store;

pub(crate) fn output_token(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::Markdown => "markdown",
        OutputKind::Json => "json",
        OutputKind::Both => "both",
    }
}

pub(crate) fn kind_token(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Single => "single",
        StageKind::Map => "map",
    }
}

/// A `stage.json` skeleton echoing the stage's effective configuration.
pub(crate) fn base_stage_meta(pipeline: &Pipeline, stage: &Stage) -> StageMeta {
    let is_map = stage.kind == StageKind::Map;
    StageMeta {
        stage_id: stage.id.clone(),
        provider: stage.provider(pipeline).to_string(),
        model: stage.model(pipeline).to_string(),
        temperature: stage.temperature(pipeline),
        reasoning: stage.reasoning(pipeline).cloned(),
        enabled: stage.enabled,
        output: output_token(stage.output).to_string(),
        kind: kind_token(stage.kind).to_string(),
        publish: stage.publish,
        list_source: stage.list_source.clone(),
        execution_mode: is_map.then(|| stage.execution_mode().as_str().to_string()),
        max_in_flight: is_map.then(|| stage.max_in_flight()),
        prompt: None,
        context_fields: Vec::new(),
        status: StageStatus::Started,
        started_at: Some(store::utc_now()),
        completed_at: None,
        failed_at: None,
        skipped_at: None,
        skip_reason: None,
        error: None,
        dependency: None,
        items_total: None,
        items_completed: None,
        items_failed: None,
        items_skipped: None,
        submission_id: None,
        batch_status: None,
    }
}

/// The `run.json` summary row derived from a full stage record.
pub(crate) fn summary_of(meta: &StageMeta) -> StageSummary {
    StageSummary {
        status: meta.status,
        started_at: meta.started_at.clone(),
        completed_at: meta.completed_at.clone(),
        failed_at: meta.failed_at.clone(),
        skipped_at: meta.skipped_at.clone(),
        skip_reason: meta.skip_reason.clone(),
        provider: Some(meta.provider.clone()),
        model: Some(meta.model.clone()),
        temperature: meta.temperature,
        reasoning: meta.reasoning.clone(),
        enabled: Some(meta.enabled),
        execution_mode: meta.execution_mode.clone(),
        max_in_flight: meta.max_in_flight,
        items_completed: meta.items_completed,
        items_failed: meta.items_failed,
        items_skipped: meta.items_skipped,
        error: meta.error.clone(),
        dependency: meta.dependency.clone(),
        submission_id: meta.submission_id.clone(),
    }
}

/// Render an optional value for a log line.
pub(crate) fn log_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}
