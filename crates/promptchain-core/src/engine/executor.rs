//! Single-stage execution and the per-item post-processing path shared by
//! the map scheduler's concurrent and batch modes.
//!
//! The order of writes on the happy path is load-bearing: the raw response
//! lands on disk before any parsing is attempted, and the output artifact
//! lands before the final `stage.json`. A crash mid-write can therefore
//! never produce an apparently-complete stage with no raw evidence.

use serde_json::{Value, json};

use promptchain_types::pipeline::{OutputKind, Pipeline, Stage};
use promptchain_types::provider::CompletionRequest;
use promptchain_types::run::{ItemMeta, ItemStatus, ManifestEntry, RunMeta, StageMeta, StageStatus};

use crate::context::StageContext;
use crate::normalize::{self, Item};
use crate::provider::ProviderHandle;
use crate::store::{ArtifactStore, utc_now};

use super::runner::RunnerError;
use super::{base_stage_meta, log_opt, summary_of};

/// Persist a stage record and its `run.json` summary row.
pub(crate) async fn persist_stage(
    store: &ArtifactStore,
    run: &mut RunMeta,
    meta: &StageMeta,
) -> Result<(), RunnerError> {
    store.write_stage_meta(meta).await?;
    run.stages.insert(meta.stage_id.clone(), summary_of(meta));
    store.write_run_meta(run).await?;
    Ok(())
}

/// Run one single-kind stage end to end. The caller has already verified
/// the stage is not completed and assembled the upstream context.
pub(crate) async fn run_single_stage(
    store: &ArtifactStore,
    pipeline: &Pipeline,
    stage: &Stage,
    context: &StageContext,
    provider: &ProviderHandle,
    run: &mut RunMeta,
) -> Result<(), RunnerError> {
    let mut meta = base_stage_meta(pipeline, stage);

    let (prompt, fields) = match context.render_prompt(&stage.prompt) {
        Ok(rendered) => rendered,
        Err(source) => {
            meta.status = StageStatus::Failed;
            meta.failed_at = Some(utc_now());
            meta.error = Some(source.kind().to_string());
            persist_stage(store, run, &meta).await?;
            store
                .append_event(&format!(
                    "stage:{} status=failed error={}",
                    stage.id,
                    source.kind()
                ))
                .await;
            return Err(RunnerError::Context {
                stage_id: stage.id.clone(),
                source,
            });
        }
    };

    meta.prompt = Some(prompt.clone());
    meta.context_fields = fields.clone();
    persist_stage(store, run, &meta).await?;
    store
        .write_context(
            &stage.id,
            None,
            &json!({
                "rendered_prompt": prompt,
                "context_all": context.context_all(),
                "context_used": context.context_used(&fields),
            }),
        )
        .await?;
    store
        .append_event(&format!(
            "stage:{} status=started mode=single provider={} model={} \
             temperature={} reasoning_effort={}",
            stage.id,
            meta.provider,
            meta.model,
            log_opt(meta.temperature),
            log_opt(meta.reasoning.as_ref().map(|r| r.effort.clone())),
        ))
        .await;

    tracing::info!(
        stage_id = stage.id.as_str(),
        provider = meta.provider.as_str(),
        model = meta.model.as_str(),
        "executing single stage"
    );

    let request = CompletionRequest {
        model: meta.model.clone(),
        prompt,
        temperature: meta.temperature,
        reasoning: meta.reasoning.clone(),
    };
    let response = match provider.completion.complete(&request).await {
        Ok(response) => response,
        Err(source) => {
            store
                .write_error(
                    &stage.id,
                    None,
                    &json!({
                        "stage_id": stage.id,
                        "error": source.kind(),
                        "detail": source.to_string(),
                    }),
                )
                .await?;
            meta.status = StageStatus::Failed;
            meta.failed_at = Some(utc_now());
            meta.error = Some(source.kind().to_string());
            persist_stage(store, run, &meta).await?;
            store
                .append_event(&format!(
                    "stage:{} status=failed error={}",
                    stage.id,
                    source.kind()
                ))
                .await;
            return Err(RunnerError::Provider {
                stage_id: stage.id.clone(),
                source,
            });
        }
    };

    // Raw first, always, before any parsing.
    store.write_raw(&stage.id, None, &response.text).await?;

    match stage.output {
        OutputKind::Json => {
            let normalized = match normalize::normalize_response(&response.text) {
                Ok(normalized) => normalized,
                Err(source) => {
                    store
                        .write_error(
                            &stage.id,
                            None,
                            &json!({
                                "stage_id": stage.id,
                                "error": source.kind(),
                                "detail": source.to_string(),
                            }),
                        )
                        .await?;
                    meta.status = StageStatus::Failed;
                    meta.failed_at = Some(utc_now());
                    meta.error = Some(source.kind().to_string());
                    persist_stage(store, run, &meta).await?;
                    store
                        .append_event(&format!(
                            "stage:{} status=failed error={}",
                            stage.id,
                            source.kind()
                        ))
                        .await;
                    return Err(RunnerError::Parse {
                        stage_id: stage.id.clone(),
                        source,
                    });
                }
            };
            store
                .write_json(&store.stage_output_path(stage), &normalized.to_value())
                .await?;
        }
        OutputKind::Markdown => {
            store
                .write_text(&store.stage_output_path(stage), &response.text)
                .await?;
        }
        OutputKind::Both => {
            store
                .write_text(&store.stage_output_path(stage), &response.text)
                .await?;
            // JSON is a best-effort extra for `both`: markdown is the
            // declared deliverable.
            if let Ok(parsed) = normalize::parse_json_response(&response.text) {
                store
                    .write_json(&store.stage_dir(&stage.id).join("output.json"), &parsed)
                    .await?;
            }
        }
    }

    meta.status = StageStatus::Completed;
    meta.completed_at = Some(utc_now());
    persist_stage(store, run, &meta).await?;
    store
        .append_event(&format!(
            "stage:{} status=completed provider={} model={} temperature={} \
             reasoning_effort={}",
            stage.id,
            meta.provider,
            meta.model,
            log_opt(meta.temperature),
            log_opt(meta.reasoning.as_ref().map(|r| r.effort.clone())),
        ))
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-item path (shared between concurrent and batch modes)
// ---------------------------------------------------------------------------

/// One selected, not-yet-completed item queued for execution.
#[derive(Debug, Clone)]
pub(crate) struct ItemWork {
    pub index: usize,
    pub item: Item,
    pub prompt: String,
    /// The full `context.json` payload for this item.
    pub context_json: Value,
}

/// The `stage.json` shell for one item.
pub(crate) fn item_meta_shell(
    stage_meta: &StageMeta,
    work: &ItemWork,
    status: ItemStatus,
) -> ItemMeta {
    ItemMeta {
        stage_id: stage_meta.stage_id.clone(),
        item_id: work.item.id.clone(),
        item_index: work.index,
        provider: Some(stage_meta.provider.clone()),
        model: Some(stage_meta.model.clone()),
        temperature: stage_meta.temperature,
        reasoning: stage_meta.reasoning.clone(),
        execution_mode: stage_meta.execution_mode.clone(),
        output: Some(stage_meta.output.clone()),
        prompt: Some(work.prompt.clone()),
        status,
        started_at: matches!(status, ItemStatus::Running).then(utc_now),
        submitted_at: matches!(status, ItemStatus::SubmittedPending).then(utc_now),
        completed_at: None,
        failed_at: None,
        skipped_at: None,
        error: None,
    }
}

/// Write the item's shell artifacts: `item.json`, `stage.json`,
/// `context.json`.
pub(crate) async fn write_item_shell(
    store: &ArtifactStore,
    stage_id: &str,
    work: &ItemWork,
    item_meta: &ItemMeta,
) -> Result<(), RunnerError> {
    let item_dir = store.item_dir(stage_id, &work.item.id);
    store
        .write_json(&item_dir.join("item.json"), &work.item.to_value())
        .await?;
    store
        .write_json(&item_dir.join("stage.json"), item_meta)
        .await?;
    store
        .write_context(stage_id, Some(&work.item.id), &work.context_json)
        .await?;
    Ok(())
}

/// Post-process one item's raw response: write `raw.txt`, parse per the
/// stage's output kind, write the output artifact, finalize the item's
/// `stage.json`, and return the manifest row. Identical across execution
/// modes.
pub(crate) async fn finish_item(
    store: &ArtifactStore,
    stage: &Stage,
    work: &ItemWork,
    mut item_meta: ItemMeta,
    response_text: &str,
) -> Result<ManifestEntry, RunnerError> {
    let item_id = &work.item.id;
    let raw_path = store.write_raw(&stage.id, Some(item_id), response_text).await?;

    if stage.output.wants_json() {
        match normalize::normalize_response(response_text) {
            Ok(normalized) => {
                let json_path = store.item_dir(&stage.id, item_id).join("output.json");
                store.write_json(&json_path, &normalized.to_value()).await?;
            }
            Err(source) if stage.output == OutputKind::Json => {
                return fail_item(
                    store,
                    stage,
                    work,
                    item_meta,
                    source.kind(),
                    &source.to_string(),
                    Some(raw_path.as_path()),
                )
                .await;
            }
            // `both` keeps markdown as the deliverable.
            Err(_) => {}
        }
    }
    if stage.output.wants_markdown() {
        store
            .write_text(
                &store.item_dir(&stage.id, item_id).join("output.md"),
                response_text,
            )
            .await?;
    }

    let output_path = store.item_output_path(stage, item_id);
    item_meta.status = ItemStatus::Completed;
    item_meta.completed_at = Some(utc_now());
    store
        .write_json(
            &store.item_dir(&stage.id, item_id).join("stage.json"),
            &item_meta,
        )
        .await?;
    store
        .append_event(&format!("stage:{} item:{item_id} status=completed", stage.id))
        .await;

    Ok(ManifestEntry {
        item_id: item_id.clone(),
        selected: true,
        status: ItemStatus::Completed,
        item: work.item.to_value(),
        output_path: Some(store.relative(&output_path)),
        raw_path: Some(store.relative(&raw_path)),
        error: None,
        error_path: None,
    })
}

/// Record one item's failure: `error.json`, failed `stage.json`, log line,
/// manifest row. Sibling items are unaffected.
pub(crate) async fn fail_item(
    store: &ArtifactStore,
    stage: &Stage,
    work: &ItemWork,
    mut item_meta: ItemMeta,
    error_kind: &str,
    detail: &str,
    raw_path: Option<&std::path::Path>,
) -> Result<ManifestEntry, RunnerError> {
    let item_id = &work.item.id;
    let error_path = store
        .write_error(
            &stage.id,
            Some(item_id),
            &json!({
                "stage_id": stage.id,
                "item_id": item_id,
                "item_index": work.index,
                "error": error_kind,
                "detail": detail,
            }),
        )
        .await?;

    item_meta.status = ItemStatus::Failed;
    item_meta.failed_at = Some(utc_now());
    item_meta.error = Some(error_kind.to_string());
    store
        .write_json(
            &store.item_dir(&stage.id, item_id).join("stage.json"),
            &item_meta,
        )
        .await?;
    store
        .append_event(&format!(
            "stage:{} item:{item_id} status=failed error={error_kind}",
            stage.id
        ))
        .await;

    Ok(ManifestEntry {
        item_id: item_id.clone(),
        selected: true,
        status: ItemStatus::Failed,
        item: work.item.to_value(),
        output_path: None,
        raw_path: raw_path.map(|p| store.relative(p)),
        error: Some(format!("{error_kind}: {detail}")),
        error_path: Some(store.relative(&error_path)),
    })
}
