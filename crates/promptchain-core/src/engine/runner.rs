//! The runner: resolves which stages to execute, drives them in pipeline
//! order, detects completion from artifacts, and publishes final outputs.
//!
//! The runner itself is single-threaded: stages execute sequentially in
//! declaration order, so downstream stages observe upstream artifacts
//! exactly as they were when execution began. Parallelism exists only
//! inside a map stage, behind the scheduler.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use promptchain_types::pipeline::{Pipeline, Stage, StageKind};
use promptchain_types::run::{
    PublishRecord, PublishedArtifact, RunMeta, RunStatus, StageStatus,
};

use crate::context::{ContextError, StageContext};
use crate::normalize::NormalizeError;
use crate::pipeline::{PipelineError, stage_dependencies};
use crate::provider::{ProviderHandle, ProviderSource};
use crate::store::{ArtifactStore, StoreError, utc_now};

use promptchain_types::provider::ProviderError;
use promptchain_types::run::Manifest;

use super::{base_stage_meta, executor, scheduler, summary_of};

/// Errors surfaced by the runner. Stage-level failures abort the stage loop
/// but never delete prior artifacts; the run directory stays resumable.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Configuration problem: bad flags, unknown stages or providers,
    /// disabled-dependency references. Fails fast.
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Context assembly failed for a stage; no provider call was made.
    #[error("stage '{stage_id}': {source}")]
    Context {
        stage_id: String,
        #[source]
        source: ContextError,
    },

    /// A provider call failed; the error class is recorded, never retried.
    #[error("stage '{stage_id}': {source}")]
    Provider {
        stage_id: String,
        #[source]
        source: ProviderError,
    },

    /// A declared-JSON output did not parse; raw output remains saved.
    #[error("stage '{stage_id}': {source}")]
    Parse {
        stage_id: String,
        #[source]
        source: NormalizeError,
    },

    /// Filesystem failure. Fatal to the run.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stage reached a failed terminal status.
    #[error("stage '{stage_id}' failed: {detail}")]
    StageFailed { stage_id: String, detail: String },
}

/// Flags controlling which stages execute.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume into an existing run directory.
    pub run_dir: Option<PathBuf>,
    /// Run exactly one stage.
    pub stage: Option<String>,
    /// Start of the contiguous range (inclusive).
    pub from_stage: Option<String>,
    /// End of the contiguous range (inclusive).
    pub stop_after: Option<String>,
    /// Override concurrent-mode worker-pool width for this invocation.
    pub max_in_flight: Option<usize>,
}

/// What a finished run looks like to the caller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
}

/// The engine's entry point: executes pipelines against run directories.
pub struct Runner {
    runs_root: PathBuf,
    providers: Arc<dyn ProviderSource>,
}

impl Runner {
    pub fn new(runs_root: impl Into<PathBuf>, providers: Arc<dyn ProviderSource>) -> Self {
        Self {
            runs_root: runs_root.into(),
            providers,
        }
    }

    /// Execute a pipeline. Prints `run_dir: <path>` to stdout as soon as
    /// the run directory exists, before any other output.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        params: BTreeMap<String, Value>,
        options: RunOptions,
    ) -> Result<RunOutcome, RunnerError> {
        let (start_idx, stop_idx) = resolve_range(pipeline, &options)?;
        if options.run_dir.is_none() && start_idx > 0 {
            return Err(RunnerError::Config(
                "Starting from a later stage requires --run-dir to resume.".to_string(),
            ));
        }

        let (store, mut run) = self.open_run(pipeline, params, &options).await?;
        let store = Arc::new(store);
        println!("run_dir: {}", store.run_dir().display());

        // Every enabled stage before the start index must already be
        // complete on disk.
        for stage in &pipeline.stages[..start_idx] {
            if stage.enabled && !store.is_stage_completed(stage).await {
                return Err(RunnerError::Config(format!(
                    "Cannot start at '{}': upstream stage '{}' is incomplete.",
                    pipeline.stages[start_idx].id, stage.id
                )));
            }
        }

        let result = self
            .run_stages(pipeline, &store, &mut run, start_idx, stop_idx, &options)
            .await;

        match result {
            Ok(status) => Ok(RunOutcome {
                run_id: run.run_id.clone(),
                run_dir: store.run_dir().to_path_buf(),
                status,
            }),
            Err(error) => {
                run.status = RunStatus::Failed;
                run.error = Some(error.to_string());
                run.failed_at = Some(utc_now());
                store.write_run_meta(&run).await?;
                store
                    .append_event(&format!("run status=failed error={error}"))
                    .await;
                Err(error)
            }
        }
    }

    /// Create a fresh run directory, or open an existing one for resume.
    async fn open_run(
        &self,
        pipeline: &Pipeline,
        params: BTreeMap<String, Value>,
        options: &RunOptions,
    ) -> Result<(ArtifactStore, RunMeta), RunnerError> {
        match &options.run_dir {
            None => {
                let (run_id, store) = ArtifactStore::create(&self.runs_root).await?;
                let run = RunMeta {
                    run_id,
                    pipeline: pipeline.name.clone(),
                    pipeline_provider: pipeline.provider.clone(),
                    pipeline_model: pipeline.model.clone(),
                    pipeline_temperature: pipeline.temperature,
                    pipeline_reasoning: pipeline.reasoning.clone(),
                    pipeline_path: pipeline.path.clone(),
                    params,
                    started_at: utc_now(),
                    status: RunStatus::Started,
                    stages: BTreeMap::new(),
                    completed_at: None,
                    stopped_at: None,
                    failed_at: None,
                    batch_pending_at: None,
                    error: None,
                    output: None,
                };
                store.write_run_meta(&run).await?;
                store
                    .append_event(&format!(
                        "run status=started pipeline={}",
                        pipeline.name
                    ))
                    .await;
                Ok((store, run))
            }
            Some(run_dir) => {
                let store = ArtifactStore::open(run_dir.clone());
                let run = store.read_run_meta().await?;
                if run.pipeline != pipeline.name {
                    return Err(RunnerError::Config(format!(
                        "Pipeline name '{}' does not match existing run '{}'.",
                        pipeline.name, run.pipeline
                    )));
                }
                store
                    .append_event(&format!(
                        "run status=resumed pipeline={}",
                        pipeline.name
                    ))
                    .await;
                Ok((store, run))
            }
        }
    }

    async fn run_stages(
        &self,
        pipeline: &Pipeline,
        store: &Arc<ArtifactStore>,
        run: &mut RunMeta,
        start_idx: usize,
        stop_idx: usize,
        options: &RunOptions,
    ) -> Result<RunStatus, RunnerError> {
        let disabled: HashSet<&str> = pipeline
            .stages
            .iter()
            .filter(|s| !s.enabled)
            .map(|s| s.id.as_str())
            .collect();

        for (idx, stage) in pipeline.stages.iter().enumerate() {
            if idx < start_idx || idx > stop_idx {
                continue;
            }

            if !stage.enabled {
                self.skip_disabled(store, pipeline, stage, run).await?;
                if idx == stop_idx {
                    return self.finish(pipeline, store, run, stop_idx).await;
                }
                continue;
            }

            // A reference to a disabled upstream is fatal, with a stable
            // message naming both stages.
            for dep in stage_dependencies(pipeline, stage) {
                if disabled.contains(dep.as_str()) {
                    return self
                        .fail_disabled_dependency(store, pipeline, stage, run, &dep)
                        .await;
                }
            }

            if store.is_stage_completed(stage).await {
                tracing::debug!(stage_id = stage.id.as_str(), "reusing completed stage");
                store
                    .append_event(&format!("stage:{} status=reused", stage.id))
                    .await;
                if idx == stop_idx {
                    return self.finish(pipeline, store, run, stop_idx).await;
                }
                continue;
            }

            let context = self
                .gather_context(pipeline, store, run, stage, idx)
                .await?;
            let provider = self.provider_for(pipeline, stage)?;

            match stage.kind {
                StageKind::Single => {
                    executor::run_single_stage(store, pipeline, stage, &context, &provider, run)
                        .await?;
                }
                StageKind::Map => {
                    let status = scheduler::run_map_stage(
                        store,
                        pipeline,
                        stage,
                        &context,
                        &provider,
                        run,
                        options.max_in_flight,
                    )
                    .await?;
                    if status == StageStatus::Failed {
                        return Err(RunnerError::StageFailed {
                            stage_id: stage.id.clone(),
                            detail: "no item completed".to_string(),
                        });
                    }
                }
            }

            if idx == stop_idx {
                return self.finish(pipeline, store, run, stop_idx).await;
            }
        }

        self.finish(pipeline, store, run, stop_idx).await
    }

    /// Build the context for a stage: params, upstream outputs that exist
    /// on disk, and the stage's file inputs.
    async fn gather_context(
        &self,
        pipeline: &Pipeline,
        store: &ArtifactStore,
        run: &RunMeta,
        stage: &Stage,
        stage_index: usize,
    ) -> Result<StageContext, RunnerError> {
        let mut context = StageContext::new(run.params.clone());
        for prior in &pipeline.stages[..stage_index] {
            if !prior.enabled {
                continue;
            }
            if let Some((text, parsed)) = store.load_stage_output(prior).await? {
                context.add_upstream(&prior.id, text, parsed);
            }
        }
        let base_dir = pipeline
            .path
            .as_deref()
            .and_then(|p| Path::new(p).parent().map(Path::to_path_buf))
            .unwrap_or_default();
        context
            .load_file_inputs(&base_dir, &stage.file_inputs)
            .await
            .map_err(|source| RunnerError::Context {
                stage_id: stage.id.clone(),
                source,
            })?;
        Ok(context)
    }

    fn provider_for(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
    ) -> Result<Arc<ProviderHandle>, RunnerError> {
        let name = stage.provider(pipeline);
        self.providers
            .get(name)
            .map_err(|e| RunnerError::Config(format!("stage '{}': {e}", stage.id)))
    }

    /// Record a disabled stage as skipped and move on.
    async fn skip_disabled(
        &self,
        store: &ArtifactStore,
        pipeline: &Pipeline,
        stage: &Stage,
        run: &mut RunMeta,
    ) -> Result<(), RunnerError> {
        let mut meta = base_stage_meta(pipeline, stage);
        meta.status = StageStatus::Skipped;
        meta.started_at = None;
        meta.skipped_at = Some(utc_now());
        meta.skip_reason = Some("disabled_in_yaml".to_string());
        store.write_stage_meta(&meta).await?;
        run.stages.insert(stage.id.clone(), summary_of(&meta));
        store.write_run_meta(run).await?;
        store
            .append_event(&format!(
                "Stage {} SKIPPED (disabled in pipeline yaml)",
                stage.id
            ))
            .await;
        Ok(())
    }

    /// Fail fast on a reference to a disabled upstream, before any provider
    /// call.
    async fn fail_disabled_dependency(
        &self,
        store: &ArtifactStore,
        pipeline: &Pipeline,
        stage: &Stage,
        run: &mut RunMeta,
        dependency: &str,
    ) -> Result<RunStatus, RunnerError> {
        let mut meta = base_stage_meta(pipeline, stage);
        meta.status = StageStatus::Failed;
        meta.started_at = None;
        meta.failed_at = Some(utc_now());
        meta.error = Some("disabled_dependency".to_string());
        meta.dependency = Some(dependency.to_string());
        store.write_stage_summary(&meta).await?;
        run.stages.insert(stage.id.clone(), summary_of(&meta));
        store.write_run_meta(run).await?;
        store
            .append_event(&format!(
                "stage:{} status=failed error=disabled_dependency dependency={dependency}",
                stage.id
            ))
            .await;
        Err(RunnerError::Config(format!(
            "Cannot run stage '{}': dependency '{dependency}' is disabled in pipeline yaml \
             (enabled=false).",
            stage.id
        )))
    }

    /// Finalize the run record and publish deliverables.
    async fn finish(
        &self,
        pipeline: &Pipeline,
        store: &ArtifactStore,
        run: &mut RunMeta,
        stop_idx: usize,
    ) -> Result<RunStatus, RunnerError> {
        let status = if stop_idx + 1 < pipeline.stages.len() {
            run.stopped_at = Some(utc_now());
            RunStatus::Stopped
        } else if run
            .stages
            .values()
            .any(|s| s.status == StageStatus::CompletedWithErrors)
        {
            run.completed_at = Some(utc_now());
            RunStatus::CompletedWithErrors
        } else {
            run.completed_at = Some(utc_now());
            RunStatus::Completed
        };
        run.status = status;
        store.write_run_meta(run).await?;
        store.append_event(&format!("run status={status}")).await;

        self.publish(pipeline, store, run).await?;
        Ok(status)
    }

    /// Copy the publish set's canonical outputs into `output/`. Stages with
    /// `publish: true` are the set; with none declared, the last enabled
    /// stage. Intermediate artifacts (raw, context, metadata) never land
    /// here.
    async fn publish(
        &self,
        pipeline: &Pipeline,
        store: &ArtifactStore,
        run: &mut RunMeta,
    ) -> Result<(), RunnerError> {
        store.reset_output_dir().await?;
        let mut artifacts: Vec<PublishedArtifact> = Vec::new();

        for stage in publish_set(pipeline) {
            match stage.kind {
                StageKind::Map => {
                    let manifest_path = store.stage_dir(&stage.id).join("output.json");
                    if !tokio::fs::try_exists(&manifest_path).await.unwrap_or(false) {
                        continue;
                    }
                    let manifest: Manifest =
                        store.read_json(&manifest_path, "Map manifest").await?;
                    for entry in &manifest.items {
                        if entry.status != promptchain_types::run::ItemStatus::Completed {
                            continue;
                        }
                        let source = store.item_output_path(stage, &entry.item_id);
                        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                            continue;
                        }
                        let dest = store
                            .publish_copy(&source, &stage.id, Some(&entry.item_id))
                            .await?;
                        artifacts.push(PublishedArtifact {
                            stage_id: stage.id.clone(),
                            item_id: Some(entry.item_id.clone()),
                            output_path: dest,
                        });
                    }
                }
                StageKind::Single => {
                    let source = store.stage_output_path(stage);
                    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                        continue;
                    }
                    let dest = store.publish_copy(&source, &stage.id, None).await?;
                    artifacts.push(PublishedArtifact {
                        stage_id: stage.id.clone(),
                        item_id: None,
                        output_path: dest,
                    });
                }
            }
        }

        run.output = Some(PublishRecord {
            published_at: utc_now(),
            path: "output".to_string(),
            artifacts,
        });
        store.write_run_meta(run).await?;
        Ok(())
    }
}

/// The stages whose outputs are published: explicit `publish: true` stages,
/// or the last enabled stage when none are declared.
fn publish_set(pipeline: &Pipeline) -> Vec<&Stage> {
    let declared: Vec<&Stage> = pipeline
        .stages
        .iter()
        .filter(|s| s.publish && s.enabled)
        .collect();
    if !declared.is_empty() {
        return declared;
    }
    pipeline
        .stages
        .iter()
        .rev()
        .find(|s| s.enabled)
        .into_iter()
        .collect()
}

/// Resolve `--stage` / `--from-stage` / `--stop-after` into an inclusive
/// index range over the pipeline's stages.
fn resolve_range(
    pipeline: &Pipeline,
    options: &RunOptions,
) -> Result<(usize, usize), RunnerError> {
    if options.stage.is_some() && (options.from_stage.is_some() || options.stop_after.is_some()) {
        return Err(RunnerError::Config(
            "Use --stage without --from-stage or --stop-after.".to_string(),
        ));
    }

    let (from, until) = match &options.stage {
        Some(only) => (Some(only), Some(only)),
        None => (options.from_stage.as_ref(), options.stop_after.as_ref()),
    };

    let start_idx = match from {
        Some(id) => pipeline
            .stage_index(id)
            .ok_or_else(|| RunnerError::Config(format!("Start stage not found: {id}")))?,
        None => 0,
    };
    let stop_idx = match until {
        Some(id) => pipeline
            .stage_index(id)
            .ok_or_else(|| RunnerError::Config(format!("Stop-after stage not found: {id}")))?,
        None => pipeline.stages.len() - 1,
    };
    if start_idx > stop_idx {
        return Err(RunnerError::Config(
            "Start stage must come before stop-after stage.".to_string(),
        ));
    }
    Ok((start_idx, stop_idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parse_pipeline_yaml;

    fn pipeline() -> Pipeline {
        parse_pipeline_yaml(
            r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "p"
  - id: b
    prompt: "q"
  - id: c
    prompt: "r"
"#,
        )
        .unwrap()
    }

    #[test]
    fn default_range_covers_everything() {
        let (start, stop) = resolve_range(&pipeline(), &RunOptions::default()).unwrap();
        assert_eq!((start, stop), (0, 2));
    }

    #[test]
    fn stage_flag_selects_exactly_one() {
        let options = RunOptions {
            stage: Some("b".to_string()),
            ..Default::default()
        };
        let (start, stop) = resolve_range(&pipeline(), &options).unwrap();
        assert_eq!((start, stop), (1, 1));
    }

    #[test]
    fn range_flags_are_inclusive() {
        let options = RunOptions {
            from_stage: Some("b".to_string()),
            stop_after: Some("c".to_string()),
            ..Default::default()
        };
        let (start, stop) = resolve_range(&pipeline(), &options).unwrap();
        assert_eq!((start, stop), (1, 2));
    }

    #[test]
    fn stage_flag_conflicts_with_range_flags() {
        let options = RunOptions {
            stage: Some("b".to_string()),
            from_stage: Some("a".to_string()),
            ..Default::default()
        };
        let err = resolve_range(&pipeline(), &options).unwrap_err();
        assert!(err.to_string().contains("--stage without"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let options = RunOptions {
            from_stage: Some("c".to_string()),
            stop_after: Some("a".to_string()),
            ..Default::default()
        };
        let err = resolve_range(&pipeline(), &options).unwrap_err();
        assert!(err.to_string().contains("before"));
    }

    #[test]
    fn unknown_stage_flags_are_rejected() {
        let options = RunOptions {
            stage: Some("ghost".to_string()),
            ..Default::default()
        };
        let err = resolve_range(&pipeline(), &options).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn publish_set_prefers_declared_stages() {
        let pipeline = parse_pipeline_yaml(
            r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "p"
    publish: true
  - id: b
    prompt: "q"
"#,
        )
        .unwrap();
        let set = publish_set(&pipeline);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].id, "a");
    }

    #[test]
    fn publish_set_falls_back_to_last_enabled() {
        let pipeline = parse_pipeline_yaml(
            r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "p"
  - id: b
    prompt: "q"
    enabled: false
"#,
        )
        .unwrap();
        let set = publish_set(&pipeline);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].id, "a");
    }
}
