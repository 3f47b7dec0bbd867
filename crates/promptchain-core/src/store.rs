//! The artifact store: owner of the on-disk run layout.
//!
//! Every other component reads and writes a run directory through this
//! module. The layout is a stable contract:
//!
//! ```text
//! runs/<run_id>/
//!   run.json                              run-level metadata and final status
//!   run.log                               append-only event log
//!   stages/<stage_id>/
//!     stage.json  context.json  raw.txt   single-stage artifacts
//!     output.md | output.json             outputs (output.json is the map manifest)
//!     items/<item_id>/
//!       stage.json  context.json  raw.txt  item.json  output.md | output.json
//!   <stage_id>.meta.json                  per-stage summary
//!   support/stages/<stage_id>/batch.json  batch-mode state
//!   logs/stages/<stage_id>/…              raw.txt mirror + error.json
//!   output/                               published deliverables
//! ```
//!
//! Invariants: all writes are atomic (temp + rename), run directories are
//! append-only (the engine never deletes artifacts), and completion is
//! determined from the canonical output artifact alone -- file presence for
//! single stages, a terminal manifest for map stages.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use promptchain_types::pipeline::{OutputKind, Stage, StageKind};
use promptchain_types::run::{BatchState, Manifest, RunMeta, StageMeta};

/// Errors from artifact store operations. Filesystem failures are fatal to
/// the run.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} contained invalid JSON: {detail}")]
    InvalidJson { label: String, detail: String },

    #[error("run directory already exists: {0}")]
    RunExists(PathBuf),

    #[error("run metadata not found in {0}")]
    RunMetaMissing(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Generate a fresh run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp}_{}", &suffix[..8])
}

/// RFC 3339 timestamp in UTC, used for every persisted timestamp.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Handle to one run directory.
pub struct ArtifactStore {
    run_dir: PathBuf,
    log_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Create a fresh run directory under `runs_root`.
    pub async fn create(runs_root: &Path) -> Result<(String, Self), StoreError> {
        let run_id = new_run_id();
        let run_dir = runs_root.join(&run_id);
        if tokio::fs::try_exists(&run_dir).await.unwrap_or(false) {
            return Err(StoreError::RunExists(run_dir));
        }
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| StoreError::io(&run_dir, e))?;
        Ok((run_id, Self::open(run_dir)))
    }

    /// Open an existing run directory (resume).
    pub fn open(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            log_lock: Mutex::new(()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    pub fn run_meta_path(&self) -> PathBuf {
        self.run_dir.join("run.json")
    }

    pub fn stage_dir(&self, stage_id: &str) -> PathBuf {
        self.run_dir.join("stages").join(stage_id)
    }

    pub fn item_dir(&self, stage_id: &str, item_id: &str) -> PathBuf {
        self.stage_dir(stage_id).join("items").join(item_id)
    }

    /// Per-stage summary at the run root (`<stage_id>.meta.json`).
    pub fn stage_summary_path(&self, stage_id: &str) -> PathBuf {
        self.run_dir.join(format!("{stage_id}.meta.json"))
    }

    pub fn support_stage_dir(&self, stage_id: &str) -> PathBuf {
        self.run_dir.join("support").join("stages").join(stage_id)
    }

    pub fn batch_state_path(&self, stage_id: &str) -> PathBuf {
        self.support_stage_dir(stage_id).join("batch.json")
    }

    /// Mirror directory for log-consuming tooling.
    pub fn stage_logs_dir(&self, stage_id: &str) -> PathBuf {
        self.run_dir.join("logs").join("stages").join(stage_id)
    }

    pub fn item_logs_dir(&self, stage_id: &str, item_id: &str) -> PathBuf {
        self.stage_logs_dir(stage_id).join("items").join(item_id)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.run_dir.join("output")
    }

    /// Canonical output artifact for a stage. Map stages always complete
    /// into the `output.json` manifest; single stages complete into
    /// `output.md` unless they are JSON-only.
    pub fn stage_output_path(&self, stage: &Stage) -> PathBuf {
        let dir = self.stage_dir(&stage.id);
        match stage.kind {
            StageKind::Map => dir.join("output.json"),
            StageKind::Single => match stage.output {
                OutputKind::Json => dir.join("output.json"),
                OutputKind::Markdown | OutputKind::Both => dir.join("output.md"),
            },
        }
    }

    /// Canonical output artifact for one map item.
    pub fn item_output_path(&self, stage: &Stage, item_id: &str) -> PathBuf {
        let dir = self.item_dir(&stage.id, item_id);
        match stage.output {
            OutputKind::Json => dir.join("output.json"),
            OutputKind::Markdown | OutputKind::Both => dir.join("output.md"),
        }
    }

    /// A path relative to the run root, for manifests and metadata.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.run_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    // -----------------------------------------------------------------------
    // Completion probes
    // -----------------------------------------------------------------------

    /// Whether a stage's canonical output artifact exists. For map stages
    /// the manifest must also be terminal: a manifest still carrying
    /// `running` or `submitted_pending` rows belongs to an interrupted
    /// execution (e.g. an un-collected batch) and the stage must be
    /// re-entered on resume.
    pub async fn is_stage_completed(&self, stage: &Stage) -> bool {
        let path = self.stage_output_path(stage);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return false;
        }
        if stage.kind != StageKind::Map {
            return true;
        }
        match self.read_json::<Manifest>(&path, "Map manifest").await {
            Ok(manifest) => manifest.items.iter().all(|entry| {
                matches!(
                    entry.status,
                    promptchain_types::run::ItemStatus::Completed
                        | promptchain_types::run::ItemStatus::Failed
                        | promptchain_types::run::ItemStatus::Skipped
                )
            }),
            // A hand-edited or corrupt manifest is treated as incomplete;
            // the scheduler will reuse whatever item outputs exist.
            Err(_) => false,
        }
    }

    pub async fn is_item_completed(&self, stage: &Stage, item_id: &str) -> bool {
        tokio::fs::try_exists(self.item_output_path(stage, item_id))
            .await
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Atomic writes
    // -----------------------------------------------------------------------

    /// Write bytes atomically: temp file in the same directory, then rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }

    pub async fn write_text(&self, path: &Path, text: &str) -> Result<(), StoreError> {
        self.write_atomic(path, text.as_bytes()).await
    }

    pub async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(value).map_err(|e| StoreError::InvalidJson {
            label: path.display().to_string(),
            detail: e.to_string(),
        })?;
        self.write_atomic(path, text.as_bytes()).await
    }

    /// Write a raw response: canonical location first, then the log mirror.
    /// The mirror is best-effort and never consulted for completion.
    pub async fn write_raw(
        &self,
        stage_id: &str,
        item_id: Option<&str>,
        text: &str,
    ) -> Result<PathBuf, StoreError> {
        let canonical = match item_id {
            Some(item) => self.item_dir(stage_id, item).join("raw.txt"),
            None => self.stage_dir(stage_id).join("raw.txt"),
        };
        self.write_text(&canonical, text).await?;

        let mirror = match item_id {
            Some(item) => self.item_logs_dir(stage_id, item).join("raw.txt"),
            None => self.stage_logs_dir(stage_id).join("raw.txt"),
        };
        if let Err(error) = self.write_text(&mirror, text).await {
            tracing::warn!(stage_id, %error, "failed to mirror raw output");
        }
        Ok(canonical)
    }

    /// Record an error payload under the stage's log directory.
    pub async fn write_error(
        &self,
        stage_id: &str,
        item_id: Option<&str>,
        payload: &Value,
    ) -> Result<PathBuf, StoreError> {
        let path = match item_id {
            Some(item) => self.item_logs_dir(stage_id, item).join("error.json"),
            None => self.stage_logs_dir(stage_id).join("error.json"),
        };
        self.write_json(&path, payload).await?;
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Metadata records
    // -----------------------------------------------------------------------

    pub async fn write_run_meta(&self, meta: &RunMeta) -> Result<(), StoreError> {
        self.write_json(&self.run_meta_path(), meta).await
    }

    pub async fn read_run_meta(&self) -> Result<RunMeta, StoreError> {
        let path = self.run_meta_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::RunMetaMissing(self.run_dir.clone()));
        }
        self.read_json(&path, "Run metadata").await
    }

    /// Write `stage.json` and mirror the summary to `<stage_id>.meta.json`.
    pub async fn write_stage_meta(&self, meta: &StageMeta) -> Result<(), StoreError> {
        let stage_json = self.stage_dir(&meta.stage_id).join("stage.json");
        self.write_json(&stage_json, meta).await?;
        self.write_json(&self.stage_summary_path(&meta.stage_id), meta)
            .await
    }

    /// Write only the run-root summary (used for skips and failures that
    /// never open a stage directory).
    pub async fn write_stage_summary(&self, meta: &StageMeta) -> Result<(), StoreError> {
        self.write_json(&self.stage_summary_path(&meta.stage_id), meta)
            .await
    }

    pub async fn write_context(
        &self,
        stage_id: &str,
        item_id: Option<&str>,
        context: &Value,
    ) -> Result<(), StoreError> {
        let path = match item_id {
            Some(item) => self.item_dir(stage_id, item).join("context.json"),
            None => self.stage_dir(stage_id).join("context.json"),
        };
        self.write_json(&path, context).await
    }

    pub async fn write_manifest(
        &self,
        stage_id: &str,
        manifest: &Manifest,
    ) -> Result<(), StoreError> {
        let path = self.stage_dir(stage_id).join("output.json");
        self.write_json(&path, manifest).await
    }

    pub async fn write_batch_state(
        &self,
        stage_id: &str,
        state: &BatchState,
    ) -> Result<(), StoreError> {
        self.write_json(&self.batch_state_path(stage_id), state).await
    }

    pub async fn read_batch_state(&self, stage_id: &str) -> Result<Option<BatchState>, StoreError> {
        let path = self.batch_state_path(stage_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(self.read_json(&path, "Batch state").await?))
    }

    pub async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
        label: &str,
    ) -> Result<T, StoreError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| StoreError::InvalidJson {
            label: label.to_string(),
            detail: format!("{e} ({})", path.display()),
        })
    }

    /// Load a completed stage's output: its text form, and the parsed JSON
    /// when the canonical artifact is JSON. Returns `None` when the stage
    /// has no output on disk.
    pub async fn load_stage_output(
        &self,
        stage: &Stage,
    ) -> Result<Option<(String, Option<Value>)>, StoreError> {
        let path = self.stage_output_path(stage);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let is_json = stage.kind == StageKind::Map || stage.output == OutputKind::Json;
        if is_json {
            let parsed: Value = self
                .read_json(&path, &format!("Stage '{}' output", stage.id))
                .await?;
            let rendered = serde_json::to_string_pretty(&parsed).unwrap_or_default();
            Ok(Some((rendered, Some(parsed))))
        } else {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            // `both` stages may also carry a JSON artifact.
            let json_path = self.stage_dir(&stage.id).join("output.json");
            let parsed = if stage.output == OutputKind::Both
                && tokio::fs::try_exists(&json_path).await.unwrap_or(false)
            {
                Some(
                    self.read_json(&json_path, &format!("Stage '{}' output", stage.id))
                        .await?,
                )
            } else {
                None
            };
            Ok(Some((text, parsed)))
        }
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append one timestamped line to `run.log`.
    pub async fn append_event(&self, message: &str) {
        let line = format!("[{}] {message}\n", utc_now());
        let _guard = self.log_lock.lock().await;
        let path = self.run_dir.join("run.log");
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!(%error, "failed to append run.log event");
        }
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Copy a canonical artifact into the publish tree, returning the
    /// run-root-relative destination.
    pub async fn publish_copy(
        &self,
        source: &Path,
        stage_id: &str,
        item_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let dest = match item_id {
            Some(item) => self.output_dir().join(stage_id).join(item).join(file_name),
            None => self.output_dir().join(stage_id).join(file_name),
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| StoreError::io(&dest, e))?;
        Ok(self.relative(&dest))
    }

    /// Remove and recreate the publish tree. The publish pass runs only
    /// after a successful run, and `output/` holds copies, never originals.
    pub async fn reset_output_dir(&self) -> Result<(), StoreError> {
        let dir = self.output_dir();
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::run::{ItemStatus, ManifestEntry, StageStatus};
    use serde_json::json;

    fn stage(yaml: &str) -> Stage {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    async fn store() -> (tempfile::TempDir, ArtifactStore) {
        let root = tempfile::tempdir().unwrap();
        let (_, store) = ArtifactStore::create(root.path()).await.unwrap();
        (root, store)
    }

    #[test]
    fn run_ids_are_timestamped_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101T000000Z".len() + 1 + 8);
        assert!(a.contains('_'));
    }

    #[tokio::test]
    async fn canonical_output_paths_per_kind() {
        let (_root, store) = store().await;
        let md = stage("{id: a, prompt: p}");
        assert!(store.stage_output_path(&md).ends_with("stages/a/output.md"));

        let json_stage = stage("{id: b, prompt: p, output: json}");
        assert!(
            store
                .stage_output_path(&json_stage)
                .ends_with("stages/b/output.json")
        );

        let both = stage("{id: c, prompt: p, output: both}");
        assert!(store.stage_output_path(&both).ends_with("stages/c/output.md"));

        let map = stage("{id: d, kind: map, list_source: a, prompt: p, output: markdown}");
        assert!(store.stage_output_path(&map).ends_with("stages/d/output.json"));
        assert!(
            store
                .item_output_path(&map, "item_x")
                .ends_with("stages/d/items/item_x/output.md")
        );
    }

    #[tokio::test]
    async fn completion_tracks_artifact_presence() {
        let (_root, store) = store().await;
        let md = stage("{id: a, prompt: p}");
        assert!(!store.is_stage_completed(&md).await);
        store
            .write_text(&store.stage_output_path(&md), "hello")
            .await
            .unwrap();
        assert!(store.is_stage_completed(&md).await);
    }

    #[tokio::test]
    async fn atomic_writes_leave_no_temp_files() {
        let (_root, store) = store().await;
        let path = store.stage_dir("a").join("stage.json");
        store.write_json(&path, &json!({"k": 1})).await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(store.stage_dir("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["stage.json"]);
    }

    #[tokio::test]
    async fn raw_is_written_canonically_and_mirrored() {
        let (_root, store) = store().await;
        let canonical = store.write_raw("a", None, "raw body").await.unwrap();
        assert!(canonical.ends_with("stages/a/raw.txt"));
        assert_eq!(std::fs::read_to_string(&canonical).unwrap(), "raw body");
        let mirror = store.stage_logs_dir("a").join("raw.txt");
        assert_eq!(std::fs::read_to_string(mirror).unwrap(), "raw body");

        let item_raw = store.write_raw("a", Some("item_x"), "item body").await.unwrap();
        assert!(item_raw.ends_with("stages/a/items/item_x/raw.txt"));
    }

    #[tokio::test]
    async fn append_event_writes_timestamped_lines() {
        let (_root, store) = store().await;
        store.append_event("run status=started pipeline=demo").await;
        store.append_event("stage:a status=completed").await;
        let log = std::fs::read_to_string(store.run_dir().join("run.log")).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains("run status=started pipeline=demo"));
        assert!(lines[1].contains("stage:a status=completed"));
    }

    #[tokio::test]
    async fn manifest_roundtrip() {
        let (_root, store) = store().await;
        let manifest = Manifest {
            items: vec![ManifestEntry {
                item_id: "item_x".into(),
                selected: true,
                status: ItemStatus::Completed,
                item: json!({"value": "alpha"}),
                output_path: Some("stages/d/items/item_x/output.md".into()),
                raw_path: Some("stages/d/items/item_x/raw.txt".into()),
                error: None,
                error_path: None,
            }],
            list_source: Some("list_items".into()),
        };
        store.write_manifest("d", &manifest).await.unwrap();
        let restored: Manifest = store
            .read_json(&store.stage_dir("d").join("output.json"), "manifest")
            .await
            .unwrap();
        assert_eq!(restored.items.len(), 1);
        assert_eq!(restored.items[0].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn load_stage_output_for_json_stage() {
        let (_root, store) = store().await;
        let json_stage = stage("{id: b, prompt: p, output: json}");
        assert!(store.load_stage_output(&json_stage).await.unwrap().is_none());

        store
            .write_json(
                &store.stage_output_path(&json_stage),
                &json!({"items": [{"id": "item_x", "_selected": true, "value": "a"}]}),
            )
            .await
            .unwrap();
        let (text, parsed) = store
            .load_stage_output(&json_stage)
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("item_x"));
        assert_eq!(parsed.unwrap()["items"][0]["value"], json!("a"));
    }

    #[tokio::test]
    async fn publish_copy_places_artifacts_under_output() {
        let (_root, store) = store().await;
        let md = stage("{id: a, prompt: p}");
        let source = store.stage_output_path(&md);
        store.write_text(&source, "deliverable").await.unwrap();

        store.reset_output_dir().await.unwrap();
        let rel = store.publish_copy(&source, "a", None).await.unwrap();
        assert_eq!(rel, "output/a/output.md");
        let copied = store.run_dir().join(&rel);
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "deliverable");

        let rel_item = store.publish_copy(&source, "a", Some("item_x")).await.unwrap();
        assert_eq!(rel_item, "output/a/item_x/output.md");
    }

    #[tokio::test]
    async fn stage_meta_is_mirrored_to_summary() {
        let (_root, store) = store().await;
        let meta = StageMeta {
            stage_id: "a".into(),
            provider: "ollama".into(),
            model: "llama3".into(),
            temperature: Some(0.2),
            reasoning: None,
            enabled: true,
            output: "markdown".into(),
            kind: "single".into(),
            publish: false,
            list_source: None,
            execution_mode: None,
            max_in_flight: None,
            prompt: Some("hello".into()),
            context_fields: vec![],
            status: StageStatus::Completed,
            started_at: Some(utc_now()),
            completed_at: Some(utc_now()),
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
        };
        store.write_stage_meta(&meta).await.unwrap();
        let from_stage: StageMeta = store
            .read_json(&store.stage_dir("a").join("stage.json"), "stage meta")
            .await
            .unwrap();
        let from_summary: StageMeta = store
            .read_json(&store.stage_summary_path("a"), "stage summary")
            .await
            .unwrap();
        assert_eq!(from_stage.status, StageStatus::Completed);
        assert_eq!(from_summary.temperature, Some(0.2));
    }
}
