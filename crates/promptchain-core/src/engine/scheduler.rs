//! The map-stage scheduler.
//!
//! Given a map stage with a resolved item list, produces one output
//! artifact per selected item and a manifest, in either execution mode:
//!
//! - **Concurrent**: a bounded worker pool (`Semaphore` permits inside a
//!   `JoinSet`). Workers never touch the manifest; they report outcomes to
//!   the collection loop, which is the single manifest writer and rewrites
//!   `output.json` in source order after every transition.
//! - **Batch**: prepare per-item shells, submit through the provider's
//!   batch capability, poll with exponential backoff (every snapshot is
//!   appended to `support/stages/<id>/batch.json`), then fetch and run the
//!   identical per-item post-processing path.
//!
//! Items already completed on disk are reused without a provider call;
//! per-item completion is evaluated independently, so a failure never
//! cancels sibling items. The on-disk layout is identical between modes
//! except for the presence of `batch.json`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use promptchain_types::pipeline::{ExecutionMode, Pipeline, Stage};
use promptchain_types::provider::{BatchJobStatus, BatchRequest, CompletionRequest, ProviderError};
use promptchain_types::run::{
    BatchState, ItemMeta, ItemStatus, Manifest, ManifestEntry, PollSnapshot, RunMeta, RunStatus,
    StageMeta, StageStatus,
};

use crate::context::StageContext;
use crate::normalize::{self, Item};
use crate::provider::{BoxBatchProvider, ProviderHandle};
use crate::store::{ArtifactStore, utc_now};

use super::executor::{
    ItemWork, fail_item, finish_item, item_meta_shell, persist_stage, write_item_shell,
};
use super::runner::RunnerError;
use super::{base_stage_meta, log_opt};

/// Base delay between batch polls.
const POLL_BASE_DELAY: Duration = Duration::from_secs(2);

/// Cap for the exponential poll backoff.
const POLL_MAX_DELAY: Duration = Duration::from_secs(60);

/// Run a map stage to a terminal status. The caller has already verified
/// the stage is not complete and assembled the upstream context.
pub(crate) async fn run_map_stage(
    store: &Arc<ArtifactStore>,
    pipeline: &Pipeline,
    stage: &Stage,
    base_context: &StageContext,
    provider: &Arc<ProviderHandle>,
    run: &mut RunMeta,
    max_in_flight_override: Option<usize>,
) -> Result<StageStatus, RunnerError> {
    let mode = stage.execution_mode();
    if mode == ExecutionMode::Batch && !provider.supports_batch() {
        return Err(RunnerError::Config(format!(
            "Batch mode for stage '{}' requires a provider with batch support \
             ('{}' does not support it).",
            stage.id,
            provider.completion.name()
        )));
    }
    if mode == ExecutionMode::Batch && max_in_flight_override.is_some() {
        return Err(RunnerError::Config(format!(
            "Stage '{}' runs in batch mode; --max-in-flight does not apply.",
            stage.id
        )));
    }

    let (items, source_label) = resolve_items(store, pipeline, stage).await?;
    let max_in_flight = max_in_flight_override.unwrap_or_else(|| stage.max_in_flight());

    let mut meta = base_stage_meta(pipeline, stage);
    meta.max_in_flight = Some(max_in_flight);
    meta.items_total = Some(items.len());
    persist_stage(store, run, &meta).await?;
    store
        .write_context(
            &stage.id,
            None,
            &json!({
                "list_source": source_label,
                "item_count": items.len(),
                "context_all": base_context.context_all(),
            }),
        )
        .await?;
    store
        .append_event(&format!(
            "stage:{} status=started mode=map list_source={} provider={} model={} \
             temperature={} reasoning_effort={}",
            stage.id,
            source_label,
            meta.provider,
            meta.model,
            log_opt(meta.temperature),
            log_opt(meta.reasoning.as_ref().map(|r| r.effort.clone())),
        ))
        .await;
    match mode {
        ExecutionMode::Concurrent => {
            store
                .append_event(&format!(
                    "Stage {} running in CONCURRENT mode (max_in_flight={max_in_flight})",
                    stage.id
                ))
                .await;
        }
        ExecutionMode::Batch => {
            store
                .append_event(&format!(
                    "Stage {} running in BATCH mode (submit/collect)",
                    stage.id
                ))
                .await;
        }
    }

    // Build the manifest skeleton in source order and collect the work
    // queue of selected, not-yet-completed items.
    let mut entries: Vec<ManifestEntry> = Vec::with_capacity(items.len());
    let mut work: Vec<ItemWork> = Vec::new();

    for (index, item) in items.iter().enumerate() {
        if !item.selected {
            record_unselected(store, &meta, item, index).await?;
            entries.push(ManifestEntry {
                item_id: item.id.clone(),
                selected: false,
                status: ItemStatus::Skipped,
                item: item.to_value(),
                output_path: None,
                raw_path: None,
                error: None,
                error_path: None,
            });
            continue;
        }

        if store.is_item_completed(stage, &item.id).await {
            let output_path = store.item_output_path(stage, &item.id);
            let raw = store.item_dir(&stage.id, &item.id).join("raw.txt");
            let raw_path = tokio::fs::try_exists(&raw)
                .await
                .unwrap_or(false)
                .then(|| store.relative(&raw));
            entries.push(ManifestEntry {
                item_id: item.id.clone(),
                selected: true,
                status: ItemStatus::Completed,
                item: item.to_value(),
                output_path: Some(store.relative(&output_path)),
                raw_path,
                error: None,
                error_path: None,
            });
            continue;
        }

        let item_ctx = base_context.for_item(item.value.clone(), index, &item.id);
        let (prompt, fields) = match item_ctx.render_prompt(&stage.prompt) {
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
        entries.push(ManifestEntry {
            item_id: item.id.clone(),
            selected: true,
            status: match mode {
                ExecutionMode::Concurrent => ItemStatus::Running,
                ExecutionMode::Batch => ItemStatus::SubmittedPending,
            },
            item: item.to_value(),
            output_path: None,
            raw_path: None,
            error: None,
            error_path: None,
        });
        work.push(ItemWork {
            index,
            item: item.clone(),
            context_json: json!({
                "rendered_prompt": prompt,
                "context_all": item_ctx.context_all(),
                "context_used": item_ctx.context_used(&fields),
            }),
            prompt,
        });
    }

    write_manifest(store, stage, &entries, &source_label).await?;

    if !work.is_empty() {
        match mode {
            ExecutionMode::Concurrent => {
                run_concurrent(
                    store,
                    stage,
                    &meta,
                    work,
                    &mut entries,
                    &source_label,
                    provider,
                    max_in_flight,
                )
                .await?;
            }
            ExecutionMode::Batch => {
                run_batch(
                    store,
                    stage,
                    &mut meta,
                    work,
                    &mut entries,
                    &source_label,
                    provider,
                    run,
                )
                .await?;
            }
        }
    }

    finalize(store, stage, meta, &entries, &source_label, run).await
}

// ---------------------------------------------------------------------------
// Item resolution
// ---------------------------------------------------------------------------

/// Load the iteration items from the stage's `list_source`: an upstream
/// stage's normalized envelope, a JSON list file, or a plain-text file with
/// one item per non-empty trimmed line.
async fn resolve_items(
    store: &ArtifactStore,
    pipeline: &Pipeline,
    stage: &Stage,
) -> Result<(Vec<Item>, String), RunnerError> {
    let source = stage.list_source.as_deref().ok_or_else(|| {
        RunnerError::Config(format!("Map stage '{}' is missing list_source.", stage.id))
    })?;

    if let Some(upstream) = pipeline.stage(source) {
        let (_, parsed) = store.load_stage_output(upstream).await?.ok_or_else(|| {
            RunnerError::Config(format!(
                "Map stage '{}' expects a completed JSON output from '{source}'.",
                stage.id
            ))
        })?;
        let envelope = parsed.ok_or_else(|| {
            RunnerError::Config(format!(
                "Map stage '{}' expects JSON list output from '{source}'.",
                stage.id
            ))
        })?;
        let items = normalize::items_from_envelope(&envelope).map_err(|e| {
            RunnerError::Config(format!(
                "Map stage '{}' expects JSON list output from '{source}': {e}",
                stage.id
            ))
        })?;
        return Ok((items, source.to_string()));
    }

    let base_dir = pipeline
        .path
        .as_deref()
        .and_then(|p| Path::new(p).parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let path = if Path::new(source).is_absolute() {
        Path::new(source).to_path_buf()
    } else {
        base_dir.join(source)
    };
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(RunnerError::Config(format!(
            "Map source file not found: {}",
            path.display()
        )));
    }
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| RunnerError::Config(format!("failed to read {}: {e}", path.display())))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let root = if is_json {
        serde_json::from_str(&text).map_err(|e| {
            RunnerError::Config(format!(
                "Map source file contained invalid JSON: {} ({e})",
                path.display()
            ))
        })?
    } else {
        serde_json::Value::Array(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| serde_json::Value::String(line.to_string()))
                .collect(),
        )
    };
    let normalized = normalize::normalize(root).map_err(|source| RunnerError::Parse {
        stage_id: stage.id.clone(),
        source,
    })?;

    Ok((normalized.items, source.to_string()))
}

// ---------------------------------------------------------------------------
// Concurrent mode
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_concurrent(
    store: &Arc<ArtifactStore>,
    stage: &Stage,
    stage_meta: &StageMeta,
    work: Vec<ItemWork>,
    entries: &mut [ManifestEntry],
    source_label: &str,
    provider: &Arc<ProviderHandle>,
    max_in_flight: usize,
) -> Result<(), RunnerError> {
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let mut join_set: JoinSet<(usize, Result<ManifestEntry, RunnerError>)> = JoinSet::new();

    for item_work in work {
        let semaphore = Arc::clone(&semaphore);
        let store = Arc::clone(store);
        let provider = Arc::clone(provider);
        let stage = stage.clone();
        let stage_meta = stage_meta.clone();

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let index = item_work.index;
            let entry = run_worker(&store, &stage, &stage_meta, &provider, &item_work).await;
            (index, entry)
        });
    }

    // Single-writer manifest discipline: only this loop touches the
    // entries, rewriting the file in source order after every transition.
    while let Some(joined) = join_set.join_next().await {
        let (index, outcome) = joined.map_err(|e| {
            RunnerError::Config(format!("map worker for stage '{}' panicked: {e}", stage.id))
        })?;
        entries[index] = outcome?;
        write_manifest(store, stage, entries, source_label).await?;
    }

    Ok(())
}

/// One worker: shell artifacts, provider call, shared post-processing.
/// A worker failure is recorded against its item only.
async fn run_worker(
    store: &ArtifactStore,
    stage: &Stage,
    stage_meta: &StageMeta,
    provider: &ProviderHandle,
    work: &ItemWork,
) -> Result<ManifestEntry, RunnerError> {
    let item_meta = item_meta_shell(stage_meta, work, ItemStatus::Running);
    write_item_shell(store, &stage.id, work, &item_meta).await?;
    store
        .append_event(&format!(
            "stage:{} item:{} status=started mode=concurrent",
            stage.id, work.item.id
        ))
        .await;

    let request = CompletionRequest {
        model: stage_meta.model.clone(),
        prompt: work.prompt.clone(),
        temperature: stage_meta.temperature,
        reasoning: stage_meta.reasoning.clone(),
    };
    match provider.completion.complete(&request).await {
        Ok(response) => finish_item(store, stage, work, item_meta, &response.text).await,
        Err(error) => {
            fail_item(
                store,
                stage,
                work,
                item_meta,
                error.kind(),
                &error.to_string(),
                None,
            )
            .await
        }
    }
}

// ---------------------------------------------------------------------------
// Batch mode
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    store: &Arc<ArtifactStore>,
    stage: &Stage,
    meta: &mut StageMeta,
    work: Vec<ItemWork>,
    entries: &mut [ManifestEntry],
    source_label: &str,
    provider: &Arc<ProviderHandle>,
    run: &mut RunMeta,
) -> Result<(), RunnerError> {
    let batch = provider
        .batch
        .as_ref()
        .expect("batch capability checked before submission");

    let state = match store.read_batch_state(&stage.id).await? {
        Some(state) => {
            // A prior submission exists: never re-submit, go straight to
            // the poll loop.
            store
                .append_event(&format!(
                    "stage:{} status=awaiting_batch submission_id={} resumed=true",
                    stage.id, state.submission_id
                ))
                .await;
            state
        }
        None => submit_batch(store, stage, meta, &work, batch, run).await?,
    };

    meta.submission_id = Some(state.submission_id.clone());
    let terminal = poll_until_terminal(store, stage, batch, state).await?;
    meta.batch_status = Some(terminal.to_string());

    if terminal == BatchJobStatus::Failed {
        // The whole submission failed; every pending item fails with it.
        for item_work in &work {
            let item_meta = item_meta_shell(meta, item_work, ItemStatus::SubmittedPending);
            entries[item_work.index] = fail_item(
                store,
                stage,
                item_work,
                item_meta,
                "batch_failed",
                "provider reported the batch job as failed",
                None,
            )
            .await?;
            write_manifest(store, stage, entries, source_label).await?;
        }
        return Ok(());
    }

    // Fetch and post-process through the same path as concurrent mode.
    let outcomes = batch
        .fetch(meta.submission_id.as_deref().unwrap_or_default())
        .await
        .map_err(|source| RunnerError::Provider {
            stage_id: stage.id.clone(),
            source,
        })?;
    let mut by_item: BTreeMap<String, Result<String, ProviderError>> = outcomes
        .into_iter()
        .map(|o| (o.item_id, o.outcome))
        .collect();

    for item_work in &work {
        let item_meta = item_meta_shell(meta, item_work, ItemStatus::SubmittedPending);
        let entry = match by_item.remove(&item_work.item.id) {
            Some(Ok(text)) => finish_item(store, stage, item_work, item_meta, &text).await?,
            Some(Err(error)) => {
                fail_item(
                    store,
                    stage,
                    item_work,
                    item_meta,
                    error.kind(),
                    &error.to_string(),
                    None,
                )
                .await?
            }
            None => {
                fail_item(
                    store,
                    stage,
                    item_work,
                    item_meta,
                    "missing_batch_result",
                    "the provider returned no result for this item",
                    None,
                )
                .await?
            }
        };
        entries[item_work.index] = entry;
        write_manifest(store, stage, entries, source_label).await?;
    }

    Ok(())
}

/// Prepare per-item shells and submit the batch, persisting the handle to
/// `batch.json` and marking the run as pending collection.
async fn submit_batch(
    store: &ArtifactStore,
    stage: &Stage,
    meta: &mut StageMeta,
    work: &[ItemWork],
    batch: &BoxBatchProvider,
    run: &mut RunMeta,
) -> Result<BatchState, RunnerError> {
    for item_work in work {
        let item_meta = item_meta_shell(meta, item_work, ItemStatus::SubmittedPending);
        write_item_shell(store, &stage.id, item_work, &item_meta).await?;
        store
            .append_event(&format!(
                "stage:{} item:{} status=submitted",
                stage.id, item_work.item.id
            ))
            .await;
    }

    let requests: Vec<BatchRequest> = work
        .iter()
        .map(|item_work| BatchRequest {
            item_id: item_work.item.id.clone(),
            model: meta.model.clone(),
            prompt: item_work.prompt.clone(),
            temperature: meta.temperature,
            reasoning: meta.reasoning.clone(),
        })
        .collect();
    let handle = batch
        .submit(requests)
        .await
        .map_err(|source| RunnerError::Provider {
            stage_id: stage.id.clone(),
            source,
        })?;

    let state = BatchState {
        submission_id: handle.submission_id,
        submitted_at: utc_now(),
        mapping: handle.mapping,
        polls: Vec::new(),
    };
    store.write_batch_state(&stage.id, &state).await?;

    meta.status = StageStatus::AwaitingBatch;
    meta.submission_id = Some(state.submission_id.clone());
    persist_stage(store, run, meta).await?;
    run.status = RunStatus::BatchPending;
    run.batch_pending_at = Some(utc_now());
    store.write_run_meta(run).await?;
    store
        .append_event(&format!(
            "stage:{} status=batch_submitted submission_id={}",
            stage.id, state.submission_id
        ))
        .await;
    store
        .append_event(&format!(
            "To resume batch collection: re-run with --run-dir {}",
            store.run_dir().display()
        ))
        .await;
    Ok(state)
}

/// Poll with exponential backoff until the provider reports a terminal
/// status, appending every snapshot to `batch.json`.
async fn poll_until_terminal(
    store: &ArtifactStore,
    stage: &Stage,
    batch: &BoxBatchProvider,
    mut state: BatchState,
) -> Result<BatchJobStatus, RunnerError> {
    let mut delay = POLL_BASE_DELAY;
    loop {
        let report =
            batch
                .poll(&state.submission_id)
                .await
                .map_err(|source| RunnerError::Provider {
                    stage_id: stage.id.clone(),
                    source,
                })?;
        state.polls.push(PollSnapshot {
            at: utc_now(),
            status: report.status,
            counts: report.counts,
        });
        store.write_batch_state(&stage.id, &state).await?;
        store
            .append_event(&format!(
                "stage:{} status=awaiting_batch batch_status={}",
                stage.id, report.status
            ))
            .await;
        if report.status.is_terminal() {
            return Ok(report.status);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(POLL_MAX_DELAY);
    }
}

// ---------------------------------------------------------------------------
// Unselected items + finalization
// ---------------------------------------------------------------------------

/// Record an unselected item as skipped without disturbing prior artifacts.
async fn record_unselected(
    store: &ArtifactStore,
    stage_meta: &StageMeta,
    item: &Item,
    index: usize,
) -> Result<(), RunnerError> {
    let item_dir = store.item_dir(&stage_meta.stage_id, &item.id);
    let stage_json = item_dir.join("stage.json");
    if tokio::fs::try_exists(&stage_json).await.unwrap_or(false) {
        return Ok(());
    }
    store
        .write_json(&item_dir.join("item.json"), &item.to_value())
        .await?;
    let item_meta = ItemMeta {
        stage_id: stage_meta.stage_id.clone(),
        item_id: item.id.clone(),
        item_index: index,
        provider: None,
        model: None,
        temperature: None,
        reasoning: None,
        execution_mode: stage_meta.execution_mode.clone(),
        output: Some(stage_meta.output.clone()),
        prompt: None,
        status: ItemStatus::Skipped,
        started_at: None,
        submitted_at: None,
        completed_at: None,
        failed_at: None,
        skipped_at: Some(utc_now()),
        error: None,
    };
    store.write_json(&stage_json, &item_meta).await?;
    Ok(())
}

async fn write_manifest(
    store: &ArtifactStore,
    stage: &Stage,
    entries: &[ManifestEntry],
    source_label: &str,
) -> Result<(), RunnerError> {
    store
        .write_manifest(
            &stage.id,
            &Manifest {
                items: entries.to_vec(),
                list_source: Some(source_label.to_string()),
            },
        )
        .await?;
    Ok(())
}

/// Compute the terminal stage status from the manifest and persist the
/// final records.
async fn finalize(
    store: &ArtifactStore,
    stage: &Stage,
    mut meta: StageMeta,
    entries: &[ManifestEntry],
    source_label: &str,
    run: &mut RunMeta,
) -> Result<StageStatus, RunnerError> {
    let completed = entries
        .iter()
        .filter(|e| e.status == ItemStatus::Completed)
        .count();
    let failed = entries
        .iter()
        .filter(|e| e.status == ItemStatus::Failed)
        .count();
    let skipped = entries
        .iter()
        .filter(|e| e.status == ItemStatus::Skipped)
        .count();

    let status = if failed == 0 {
        StageStatus::Completed
    } else if completed > 0 {
        StageStatus::CompletedWithErrors
    } else {
        StageStatus::Failed
    };

    meta.status = status;
    meta.items_total = Some(entries.len());
    meta.items_completed = Some(completed);
    meta.items_failed = Some(failed);
    meta.items_skipped = Some(skipped);
    match status {
        StageStatus::Failed => meta.failed_at = Some(utc_now()),
        _ => meta.completed_at = Some(utc_now()),
    }

    write_manifest(store, stage, entries, source_label).await?;
    persist_stage(store, run, &meta).await?;
    store
        .append_event(&format!(
            "stage:{} status={status} items_completed={completed} items_failed={failed} \
             items_skipped={skipped} provider={} model={}",
            stage.id, meta.provider, meta.model
        ))
        .await;

    Ok(status)
}
