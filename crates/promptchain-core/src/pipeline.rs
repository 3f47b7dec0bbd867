//! Pipeline YAML parsing and structural validation.
//!
//! Converts YAML files into the canonical
//! [`promptchain_types::pipeline::Pipeline`] and validates the constraints
//! the engine relies on. The returned pipeline is guaranteed to be
//! structurally valid; dependency availability (artifacts on disk, disabled
//! upstreams) is checked later by the runner, and provider batch capability
//! is checked against the registry before any submission.

use std::collections::HashSet;
use std::path::Path;

use promptchain_types::pipeline::{Pipeline, Stage, StageKind};

use crate::template;

/// Errors from pipeline loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline file not found: {0}")]
    NotFound(String),

    #[error("failed to read pipeline file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Load and validate a pipeline from a YAML file.
pub fn load_pipeline(path: &Path) -> Result<Pipeline, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::NotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    let mut pipeline = parse_pipeline_yaml(&text)?;
    pipeline.path = Some(path.display().to_string());
    Ok(pipeline)
}

/// Parse a YAML string into a validated `Pipeline`.
pub fn parse_pipeline_yaml(yaml: &str) -> Result<Pipeline, PipelineError> {
    let pipeline: Pipeline =
        serde_yaml_ng::from_str(yaml).map_err(|e| PipelineError::Parse(e.to_string()))?;
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

/// Validate structural constraints on a pipeline.
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<(), PipelineError> {
    if pipeline.name.trim().is_empty() {
        return Err(PipelineError::Validation(
            "pipeline name must not be empty".to_string(),
        ));
    }
    if pipeline.model.trim().is_empty() {
        return Err(PipelineError::Validation(
            "pipeline model must not be empty".to_string(),
        ));
    }
    if pipeline.provider.trim().is_empty() {
        return Err(PipelineError::Validation(
            "pipeline provider must not be empty".to_string(),
        ));
    }
    if pipeline.stages.is_empty() {
        return Err(PipelineError::Validation(
            "pipeline must include a non-empty 'stages' list".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for stage in &pipeline.stages {
        if stage.id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "stage id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(stage.id.as_str()) {
            return Err(PipelineError::Validation(format!(
                "duplicate stage id: '{}'",
                stage.id
            )));
        }
        if stage.prompt.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "stage '{}' must have a non-empty prompt",
                stage.id
            )));
        }
        template::extract_fields(&stage.prompt).map_err(|e| {
            PipelineError::Validation(format!("stage '{}' prompt: {e}", stage.id))
        })?;
    }

    for (index, stage) in pipeline.stages.iter().enumerate() {
        validate_stage_shape(pipeline, stage, index)?;
        validate_references(pipeline, stage, index)?;
    }

    Ok(())
}

fn validate_stage_shape(
    pipeline: &Pipeline,
    stage: &Stage,
    index: usize,
) -> Result<(), PipelineError> {
    match stage.kind {
        StageKind::Map => {
            let source = stage.list_source.as_deref().ok_or_else(|| {
                PipelineError::Validation(format!(
                    "map stage '{}' is missing list_source",
                    stage.id
                ))
            })?;
            // A stage-id source must point backwards.
            if let Some(source_index) = pipeline.stage_index(source) {
                if source_index >= index {
                    return Err(PipelineError::Validation(format!(
                        "map stage '{}' must reference an upstream stage, \
                         but '{source}' is not earlier in the pipeline",
                        stage.id
                    )));
                }
            }
            if let Some(max) = stage.max_in_flight {
                if max < 1 {
                    return Err(PipelineError::Validation(format!(
                        "stage '{}': max_in_flight must be >= 1",
                        stage.id
                    )));
                }
            }
        }
        StageKind::Single => {
            if stage.list_source.is_some() {
                return Err(PipelineError::Validation(format!(
                    "stage '{}' is not a map stage and cannot declare list_source",
                    stage.id
                )));
            }
            if stage.execution_mode.is_some() || stage.max_in_flight.is_some() {
                return Err(PipelineError::Validation(format!(
                    "stage '{}' is not a map stage and cannot declare execution_mode \
                     or max_in_flight",
                    stage.id
                )));
            }
        }
    }
    Ok(())
}

/// Template references to stages must name existing, earlier stages: a
/// reference to a later stage is a configuration error, which also rules
/// out cycles.
fn validate_references(
    pipeline: &Pipeline,
    stage: &Stage,
    index: usize,
) -> Result<(), PipelineError> {
    for dep in template_stage_references(stage) {
        match pipeline.stage_index(&dep) {
            None => {
                return Err(PipelineError::Validation(format!(
                    "stage '{}' references unknown stage '{dep}'",
                    stage.id
                )));
            }
            Some(dep_index) if dep_index >= index => {
                return Err(PipelineError::Validation(format!(
                    "stage '{}' references stage '{dep}' which is not earlier \
                     in the pipeline",
                    stage.id
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Stage ids referenced through `stage_outputs[…]` / `stage_json[…]`
/// template placeholders.
fn template_stage_references(stage: &Stage) -> Vec<String> {
    let mut refs = Vec::new();
    if let Ok(fields) = template::extract_fields(&stage.prompt) {
        for field in fields {
            let path = crate::template::FieldPath::parse(&field);
            if matches!(path.root.as_str(), "stage_outputs" | "stage_json") {
                if let Some(id) = path.indices.first() {
                    if !refs.contains(id) {
                        refs.push(id.clone());
                    }
                }
            }
        }
    }
    refs
}

/// Upstream stage ids a stage depends on: its `list_source` when it names a
/// pipeline stage, plus every `stage_outputs[…]` / `stage_json[…]` template
/// reference. Used by the runner for dependency validation.
pub fn stage_dependencies(pipeline: &Pipeline, stage: &Stage) -> Vec<String> {
    let mut deps = Vec::new();

    if stage.kind == StageKind::Map {
        if let Some(source) = &stage.list_source {
            if pipeline.stage_index(source).is_some() {
                deps.push(source.clone());
            }
        }
    }

    for id in template_stage_references(stage) {
        if !deps.contains(&id) {
            deps.push(id);
        }
    }

    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: list_items
    prompt: "List 5 things about {topic} as JSON."
    output: json
  - id: expand_items
    kind: map
    list_source: list_items
    prompt: "Expand {item}."
"#;

    #[test]
    fn parses_a_valid_pipeline() {
        let pipeline = parse_pipeline_yaml(VALID).unwrap();
        assert_eq!(pipeline.name, "demo");
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stages[1].kind, StageKind::Map);
    }

    #[test]
    fn rejects_duplicate_stage_ids() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "p"
  - id: a
    prompt: "q"
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate stage id"));
    }

    #[test]
    fn rejects_map_stage_without_list_source() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: expand
    kind: map
    prompt: "Expand {item}."
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("missing list_source"));
    }

    #[test]
    fn rejects_forward_template_reference() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: first
    prompt: "Use {stage_outputs[second]}."
  - id: second
    prompt: "p"
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not earlier"));
    }

    #[test]
    fn rejects_forward_list_source() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: expand
    kind: map
    list_source: later
    prompt: "Expand {item}."
  - id: later
    prompt: "p"
    output: json
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn rejects_single_stage_with_map_fields() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "p"
    max_in_flight: 3
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not a map stage"));
    }

    #[test]
    fn file_path_list_source_is_not_a_dependency() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: expand
    kind: map
    list_source: ./items.json
    prompt: "Expand {item}."
"#;
        let pipeline = parse_pipeline_yaml(yaml).unwrap();
        assert!(stage_dependencies(&pipeline, &pipeline.stages[0]).is_empty());
    }

    #[test]
    fn dependencies_include_list_source_and_template_refs() {
        let pipeline = parse_pipeline_yaml(VALID).unwrap();
        let deps = stage_dependencies(&pipeline, &pipeline.stages[1]);
        assert_eq!(deps, vec!["list_items"]);
    }

    #[test]
    fn rejects_unknown_template_reference() {
        let yaml = r#"
name: demo
provider: ollama
model: llama3
stages:
  - id: a
    prompt: "Use {stage_json[ghost]}."
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown stage 'ghost'"));
    }
}
