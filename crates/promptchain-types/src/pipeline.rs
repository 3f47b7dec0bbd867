//! Pipeline definition types.
//!
//! A pipeline is an ordered list of stages plus pipeline-wide defaults for
//! provider, model, temperature, and reasoning. Stage order in the
//! definition is the execution order; dependencies between stages are
//! expressed implicitly through template references to upstream outputs.
//!
//! These structs are the deserialization target for pipeline YAML files.
//! Structural validation lives in `promptchain-core::pipeline`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A full pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Human-readable pipeline name. Also checked on resume.
    pub name: String,
    /// Default provider for all stages (e.g. "ollama", "openai").
    pub provider: String,
    /// Default model for all stages.
    pub model: String,
    /// Default sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Default reasoning configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Declared user-parameter names. Advisory: parameters are bound into
    /// the context whether declared or not.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    /// Ordered stage definitions. Declaration order is execution order.
    pub stages: Vec<Stage>,
    /// Path of the YAML file this pipeline was loaded from. Relative
    /// `file_inputs` and `list_source` paths resolve against its directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Pipeline {
    /// Position of a stage in declaration order, if present.
    pub fn stage_index(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == stage_id)
    }

    /// Look up a stage by id.
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }
}

/// One prompt-driven unit within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stable stage id, unique within the pipeline.
    pub id: String,
    /// Single provider call, or fan-out over a list of items.
    #[serde(default)]
    pub kind: StageKind,
    /// Prompt template with `{field}` placeholders.
    pub prompt: String,
    /// What the stage produces.
    #[serde(default)]
    pub output: OutputKind,
    /// Per-stage model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-stage provider override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Per-stage temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Per-stage reasoning override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Disabled stages are skipped; referencing one is a fatal error.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether this stage's outputs are copied into `output/` after the run.
    #[serde(default)]
    pub publish: bool,
    /// Files bound into the template context, keyed by context name.
    #[serde(default, alias = "file_input", skip_serializing_if = "BTreeMap::is_empty")]
    pub file_inputs: BTreeMap<String, FileInput>,
    /// Map stages only: an upstream stage id or a JSON/plain-text file path
    /// supplying the iteration items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_source: Option<String>,
    /// Map stages only: how items are executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Concurrent mode only: bounded worker-pool width. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

impl Stage {
    /// Effective model after applying the pipeline default.
    pub fn model<'a>(&'a self, pipeline: &'a Pipeline) -> &'a str {
        self.model.as_deref().unwrap_or(&pipeline.model)
    }

    /// Effective provider after applying the pipeline default.
    pub fn provider<'a>(&'a self, pipeline: &'a Pipeline) -> &'a str {
        self.provider.as_deref().unwrap_or(&pipeline.provider)
    }

    /// Effective temperature after applying the pipeline default.
    pub fn temperature(&self, pipeline: &Pipeline) -> Option<f64> {
        self.temperature.or(pipeline.temperature)
    }

    /// Effective reasoning configuration after applying the pipeline default.
    pub fn reasoning<'a>(&'a self, pipeline: &'a Pipeline) -> Option<&'a ReasoningConfig> {
        self.reasoning.as_ref().or(pipeline.reasoning.as_ref())
    }

    /// Effective execution mode for a map stage.
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode.unwrap_or(ExecutionMode::Concurrent)
    }

    /// Effective worker-pool width for concurrent mode.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(1).max(1)
    }
}

fn default_true() -> bool {
    true
}

/// The kind of stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// One provider call producing one output artifact.
    #[default]
    Single,
    /// Fan-out over a list of items, one provider call per selected item.
    Map,
}

/// What a stage produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Raw text saved as `output.md`.
    #[default]
    Markdown,
    /// Response parsed and normalized into `output.json`.
    Json,
    /// `output.md` always; `output.json` additionally when the response
    /// parses as JSON. `output.md` is the completion artifact.
    Both,
}

impl OutputKind {
    /// Whether this kind writes a markdown artifact.
    pub fn wants_markdown(self) -> bool {
        matches!(self, OutputKind::Markdown | OutputKind::Both)
    }

    /// Whether this kind writes a JSON artifact.
    pub fn wants_json(self) -> bool {
        matches!(self, OutputKind::Json | OutputKind::Both)
    }
}

/// Map-stage execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Bounded worker pool calling the sync provider per item.
    Concurrent,
    /// Asynchronous provider batch job: submit, poll, collect.
    Batch,
}

impl ExecutionMode {
    /// Stable token recorded in stage metadata and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Concurrent => "concurrent",
            ExecutionMode::Batch => "batch",
        }
    }
}

/// A file bound into a stage's template context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInput {
    /// Path to the file, relative to the pipeline file's directory unless
    /// absolute.
    pub path: String,
    /// How the content is exposed to the template.
    #[serde(default)]
    pub kind: FileInputKind,
}

/// How a file input is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileInputKind {
    /// Exposed verbatim under `inputs[<name>]` and the bare name.
    #[default]
    Text,
    /// Parsed and exposed under `inputs_json[<name>]` as well.
    Json,
}

/// Reasoning configuration forwarded to providers that support it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Effort hint (e.g. "low", "medium", "high").
    pub effort: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults() {
        let yaml = r#"
id: write
prompt: "Say hello to {topic}."
"#;
        let stage: Stage = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(stage.kind, StageKind::Single);
        assert_eq!(stage.output, OutputKind::Markdown);
        assert!(stage.enabled);
        assert!(!stage.publish);
        assert!(stage.list_source.is_none());
        assert_eq!(stage.max_in_flight(), 1);
    }

    #[test]
    fn map_stage_fields_roundtrip() {
        let yaml = r#"
id: expand
kind: map
prompt: "Expand {item}."
output: json
list_source: list_items
execution_mode: batch
max_in_flight: 3
"#;
        let stage: Stage = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(stage.kind, StageKind::Map);
        assert_eq!(stage.execution_mode(), ExecutionMode::Batch);
        assert_eq!(stage.max_in_flight, Some(3));
        assert_eq!(stage.list_source.as_deref(), Some("list_items"));
    }

    #[test]
    fn stage_overrides_fall_back_to_pipeline_defaults() {
        let pipeline = Pipeline {
            name: "demo".into(),
            provider: "ollama".into(),
            model: "llama3".into(),
            temperature: Some(0.2),
            reasoning: Some(ReasoningConfig {
                effort: "high".into(),
            }),
            params: vec![],
            stages: vec![],
            path: None,
        };
        let mut stage: Stage = serde_yaml_ng::from_str("{id: a, prompt: p}").unwrap();
        assert_eq!(stage.model(&pipeline), "llama3");
        assert_eq!(stage.provider(&pipeline), "ollama");
        assert_eq!(stage.temperature(&pipeline), Some(0.2));
        assert_eq!(stage.reasoning(&pipeline).unwrap().effort, "high");

        stage.model = Some("gpt-5".into());
        stage.provider = Some("openai".into());
        stage.temperature = Some(0.7);
        assert_eq!(stage.model(&pipeline), "gpt-5");
        assert_eq!(stage.provider(&pipeline), "openai");
        assert_eq!(stage.temperature(&pipeline), Some(0.7));
    }

    #[test]
    fn output_kind_wants() {
        assert!(OutputKind::Markdown.wants_markdown());
        assert!(!OutputKind::Markdown.wants_json());
        assert!(OutputKind::Json.wants_json());
        assert!(!OutputKind::Json.wants_markdown());
        assert!(OutputKind::Both.wants_markdown());
        assert!(OutputKind::Both.wants_json());
    }

    #[test]
    fn file_input_kind_default_is_text() {
        let input: FileInput = serde_yaml_ng::from_str("path: ./notes.md").unwrap();
        assert_eq!(input.kind, FileInputKind::Text);
    }
}
