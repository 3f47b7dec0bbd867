//! Template context assembly.
//!
//! A [`StageContext`] is the single mapping of names to values a prompt
//! template can reference: user parameters, file inputs, upstream stage
//! outputs, and (for map items) the current item bindings. It produces both
//! `context_all` (everything available) and `context_used` (only what the
//! template referenced), which are persisted to `context.json` for auditing.
//!
//! Referencing a name that is not available fails the stage before any
//! provider call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};

use promptchain_types::pipeline::{FileInput, FileInputKind};

use crate::template::{self, FieldPath, TemplateError};

/// Errors from context assembly or prompt rendering.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The template referenced a name that is not available.
    #[error("unresolved context reference: '{0}'")]
    UnresolvedReference(String),

    /// The template itself is malformed.
    #[error("template error: {0}")]
    Template(TemplateError),

    /// A configured file input does not exist.
    #[error("input file not found: {path} (input '{name}')")]
    MissingFileInput { name: String, path: PathBuf },

    /// A JSON file input did not parse.
    #[error("input file '{name}' contained invalid JSON: {detail}")]
    InvalidFileInput { name: String, detail: String },

    /// Reading a file input failed.
    #[error("failed to read input file '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ContextError {
    /// Stable lowercase token recorded in stage metadata and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::UnresolvedReference(_) => "unresolved_context_reference",
            ContextError::Template(_) => "template_error",
            ContextError::MissingFileInput { .. } => "missing_file_input",
            ContextError::InvalidFileInput { .. } => "invalid_file_input",
            ContextError::Io { .. } => "file_input_io",
        }
    }
}

/// Current-item bindings for a map-stage item.
#[derive(Debug, Clone)]
pub struct ItemBinding {
    pub value: Value,
    pub index: usize,
    pub id: String,
}

/// The assembled context for one stage (or one map item).
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    params: BTreeMap<String, Value>,
    inputs_text: BTreeMap<String, String>,
    inputs_json: BTreeMap<String, Value>,
    inputs_meta: BTreeMap<String, Value>,
    stage_outputs: BTreeMap<String, String>,
    stage_json: BTreeMap<String, Value>,
    item: Option<ItemBinding>,
}

impl StageContext {
    /// Start a context from the run's user parameters.
    pub fn new(params: BTreeMap<String, Value>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Bind an upstream stage's outputs.
    pub fn add_upstream(&mut self, stage_id: &str, text: String, parsed: Option<Value>) {
        self.stage_outputs.insert(stage_id.to_string(), text);
        if let Some(value) = parsed {
            self.stage_json.insert(stage_id.to_string(), value);
        }
    }

    /// Load and bind the stage's configured file inputs. Relative paths
    /// resolve against `base_dir` (the pipeline file's directory).
    pub async fn load_file_inputs(
        &mut self,
        base_dir: &Path,
        file_inputs: &BTreeMap<String, FileInput>,
    ) -> Result<(), ContextError> {
        for (name, input) in file_inputs {
            let path = resolve_input_path(base_dir, &input.path);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ContextError::MissingFileInput {
                    name: name.clone(),
                    path,
                });
            }
            let content =
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ContextError::Io {
                        name: name.clone(),
                        source,
                    })?;
            self.inputs_meta.insert(
                name.clone(),
                json!({
                    "path": path.display().to_string(),
                    "kind": match input.kind {
                        FileInputKind::Text => "text",
                        FileInputKind::Json => "json",
                    },
                }),
            );
            match input.kind {
                FileInputKind::Text => {
                    self.inputs_text.insert(name.clone(), content);
                }
                FileInputKind::Json => {
                    let parsed: Value = serde_json::from_str(&content).map_err(|e| {
                        ContextError::InvalidFileInput {
                            name: name.clone(),
                            detail: e.to_string(),
                        }
                    })?;
                    self.inputs_text.insert(
                        name.clone(),
                        serde_json::to_string_pretty(&parsed).unwrap_or(content),
                    );
                    self.inputs_json.insert(name.clone(), parsed);
                }
            }
        }
        Ok(())
    }

    /// Derive the per-item context for a map iteration.
    pub fn for_item(&self, value: Value, index: usize, id: &str) -> StageContext {
        let mut ctx = self.clone();
        ctx.item = Some(ItemBinding {
            value,
            index,
            id: id.to_string(),
        });
        ctx
    }

    /// Resolve one parsed field path, or `None` when unavailable.
    pub fn lookup(&self, path: &FieldPath) -> Option<Value> {
        let (head, rest) = match path.indices.split_first() {
            Some((head, rest)) => (Some(head), rest),
            None => (None, &[][..]),
        };

        match path.root.as_str() {
            "stage_outputs" => {
                let id = head?;
                index_value(&Value::String(self.stage_outputs.get(id)?.clone()), rest)
            }
            "stage_json" => {
                let id = head?;
                index_value(self.stage_json.get(id)?, rest)
            }
            "inputs" => {
                let name = head?;
                index_value(&Value::String(self.inputs_text.get(name)?.clone()), rest)
            }
            "inputs_json" => {
                let name = head?;
                index_value(self.inputs_json.get(name)?, rest)
            }
            "item" => {
                let item = self.item.as_ref()?;
                index_value(&item.value, &path.indices)
            }
            "item_value" if path.indices.is_empty() => {
                self.item.as_ref().map(|item| item.value.clone())
            }
            "item_index" if path.indices.is_empty() => {
                self.item.as_ref().map(|item| json!(item.index))
            }
            "item_id" if path.indices.is_empty() => {
                self.item.as_ref().map(|item| Value::String(item.id.clone()))
            }
            name => {
                if let Some(value) = self.params.get(name) {
                    return index_value(value, &path.indices);
                }
                if let Some(text) = self.inputs_text.get(name) {
                    return index_value(&Value::String(text.clone()), &path.indices);
                }
                None
            }
        }
    }

    /// Render a prompt template against this context.
    ///
    /// Returns the rendered prompt and the raw field expressions the
    /// template referenced.
    pub fn render_prompt(&self, prompt: &str) -> Result<(String, Vec<String>), ContextError> {
        let fields = template::extract_fields(prompt).map_err(ContextError::Template)?;
        let rendered = template::render(prompt, |path| self.lookup(path)).map_err(|e| match e {
            TemplateError::Unresolved(expr) => ContextError::UnresolvedReference(expr),
            other => ContextError::Template(other),
        })?;
        Ok((rendered, fields))
    }

    /// Everything available to the template, for `context.json`.
    pub fn context_all(&self) -> Value {
        let mut all = Map::new();
        all.insert("params".to_string(), to_object(&self.params));
        all.insert("inputs".to_string(), string_map(&self.inputs_text));
        all.insert("inputs_json".to_string(), to_object(&self.inputs_json));
        all.insert("inputs_meta".to_string(), to_object(&self.inputs_meta));
        all.insert("stage_outputs".to_string(), string_map(&self.stage_outputs));
        all.insert("stage_json".to_string(), to_object(&self.stage_json));
        if let Some(item) = &self.item {
            all.insert("item".to_string(), item.value.clone());
            all.insert("item_value".to_string(), item.value.clone());
            all.insert("item_index".to_string(), json!(item.index));
            all.insert("item_id".to_string(), Value::String(item.id.clone()));
        }
        Value::Object(all)
    }

    /// Only what the template referenced, grouped by source.
    pub fn context_used(&self, template_fields: &[String]) -> Value {
        let mut params = Map::new();
        let mut stage_outputs = Map::new();
        let mut stage_json = Map::new();
        let mut inputs = Map::new();
        let mut inputs_json = Map::new();
        let mut used = Map::new();

        for expr in template_fields {
            let path = FieldPath::parse(expr);
            let head = path.indices.first();
            match (path.root.as_str(), head) {
                ("stage_outputs", Some(id)) => {
                    if let Some(text) = self.stage_outputs.get(id) {
                        stage_outputs.insert(id.clone(), Value::String(text.clone()));
                    }
                }
                ("stage_json", Some(id)) => {
                    if let Some(value) = self.stage_json.get(id) {
                        stage_json.insert(id.clone(), value.clone());
                    }
                }
                ("inputs", Some(name)) => {
                    if let Some(text) = self.inputs_text.get(name) {
                        inputs.insert(name.clone(), Value::String(text.clone()));
                    }
                }
                ("inputs_json", Some(name)) => {
                    if let Some(value) = self.inputs_json.get(name) {
                        inputs_json.insert(name.clone(), value.clone());
                    }
                }
                ("item", _) => {
                    if let Some(item) = &self.item {
                        used.insert("item".to_string(), item.value.clone());
                    }
                }
                ("item_value", None) => {
                    if let Some(item) = &self.item {
                        used.insert("item_value".to_string(), item.value.clone());
                    }
                }
                ("item_index", None) => {
                    if let Some(item) = &self.item {
                        used.insert("item_index".to_string(), json!(item.index));
                    }
                }
                ("item_id", None) => {
                    if let Some(item) = &self.item {
                        used.insert("item_id".to_string(), Value::String(item.id.clone()));
                    }
                }
                (name, _) => {
                    if let Some(value) = self.params.get(name) {
                        params.insert(name.to_string(), value.clone());
                    } else if let Some(text) = self.inputs_text.get(name) {
                        inputs.insert(name.to_string(), Value::String(text.clone()));
                    }
                }
            }
        }

        used.insert("params".to_string(), Value::Object(params));
        used.insert("stage_outputs".to_string(), Value::Object(stage_outputs));
        used.insert("stage_json".to_string(), Value::Object(stage_json));
        if !inputs.is_empty() {
            used.insert("inputs".to_string(), Value::Object(inputs));
        }
        if !inputs_json.is_empty() {
            used.insert("inputs_json".to_string(), Value::Object(inputs_json));
        }
        used.insert(
            "template_fields".to_string(),
            Value::Array(
                template_fields
                    .iter()
                    .map(|f| Value::String(f.clone()))
                    .collect(),
            ),
        );
        Value::Object(used)
    }
}

/// Index into a JSON value by successive object keys / array positions.
fn index_value(value: &Value, indices: &[String]) -> Option<Value> {
    let mut current = value;
    for index in indices {
        current = match current {
            Value::Object(map) => map.get(index)?,
            Value::Array(items) => items.get(index.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn resolve_input_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

fn to_object<V: Clone + Into<Value>>(map: &BTreeMap<String, V>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect(),
    )
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_with_upstream() -> StageContext {
        let mut ctx = StageContext::new(BTreeMap::from([(
            "topic".to_string(),
            json!("chess"),
        )]));
        ctx.add_upstream("intro", "Intro text.".to_string(), None);
        ctx.add_upstream(
            "list_items",
            "{\"items\": []}".to_string(),
            Some(json!({"items": [{"id": "item_x", "value": "alpha"}]})),
        );
        ctx
    }

    #[test]
    fn looks_up_params_and_upstreams() {
        let ctx = context_with_upstream();
        assert_eq!(
            ctx.lookup(&FieldPath::parse("topic")),
            Some(json!("chess"))
        );
        assert_eq!(
            ctx.lookup(&FieldPath::parse("stage_outputs[intro]")),
            Some(json!("Intro text."))
        );
        assert_eq!(
            ctx.lookup(&FieldPath::parse("stage_json[list_items][items][0][value]")),
            Some(json!("alpha"))
        );
        assert_eq!(ctx.lookup(&FieldPath::parse("stage_outputs[nope]")), None);
        assert_eq!(ctx.lookup(&FieldPath::parse("unknown")), None);
    }

    #[test]
    fn item_bindings_only_exist_for_items() {
        let ctx = context_with_upstream();
        assert_eq!(ctx.lookup(&FieldPath::parse("item")), None);
        assert_eq!(ctx.lookup(&FieldPath::parse("item_index")), None);

        let item_ctx = ctx.for_item(json!({"name": "alpha"}), 2, "item_abc");
        assert_eq!(
            item_ctx.lookup(&FieldPath::parse("item[name]")),
            Some(json!("alpha"))
        );
        assert_eq!(
            item_ctx.lookup(&FieldPath::parse("item_index")),
            Some(json!(2))
        );
        assert_eq!(
            item_ctx.lookup(&FieldPath::parse("item_id")),
            Some(json!("item_abc"))
        );
    }

    #[test]
    fn render_prompt_reports_fields_and_unresolved() {
        let ctx = context_with_upstream();
        let (rendered, fields) = ctx
            .render_prompt("Write about {topic} using {stage_outputs[intro]}")
            .unwrap();
        assert_eq!(rendered, "Write about chess using Intro text.");
        assert_eq!(fields, vec!["topic", "stage_outputs[intro]"]);

        let err = ctx.render_prompt("Use {stage_outputs[ghost]}").unwrap_err();
        match err {
            ContextError::UnresolvedReference(expr) => {
                assert_eq!(expr, "stage_outputs[ghost]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn context_used_is_a_subset() {
        let ctx = context_with_upstream();
        let fields = vec!["topic".to_string(), "stage_outputs[intro]".to_string()];
        let used = ctx.context_used(&fields);
        assert_eq!(used["params"]["topic"], json!("chess"));
        assert_eq!(used["stage_outputs"]["intro"], json!("Intro text."));
        assert!(used["stage_json"].as_object().unwrap().is_empty());
        assert_eq!(used["template_fields"], json!(["topic", "stage_outputs[intro]"]));
    }

    #[test]
    fn context_used_records_item_bindings() {
        let ctx = context_with_upstream().for_item(json!({"name": "alpha"}), 0, "item_abc");
        let fields = vec![
            "item[name]".to_string(),
            "item_index".to_string(),
            "item_id".to_string(),
        ];
        let used = ctx.context_used(&fields);
        assert_eq!(used["item"], json!({"name": "alpha"}));
        assert_eq!(used["item_index"], json!(0));
        assert_eq!(used["item_id"], json!("item_abc"));
    }

    #[tokio::test]
    async fn file_inputs_load_text_and_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "some notes").unwrap();
        std::fs::write(dir.path().join("data.json"), r#"{"k": 1}"#).unwrap();

        let mut inputs = BTreeMap::new();
        inputs.insert(
            "notes".to_string(),
            FileInput {
                path: "notes.md".to_string(),
                kind: FileInputKind::Text,
            },
        );
        inputs.insert(
            "data".to_string(),
            FileInput {
                path: "data.json".to_string(),
                kind: FileInputKind::Json,
            },
        );

        let mut ctx = StageContext::new(BTreeMap::new());
        ctx.load_file_inputs(dir.path(), &inputs).await.unwrap();

        assert_eq!(
            ctx.lookup(&FieldPath::parse("inputs[notes]")),
            Some(json!("some notes"))
        );
        assert_eq!(
            ctx.lookup(&FieldPath::parse("notes")),
            Some(json!("some notes"))
        );
        assert_eq!(
            ctx.lookup(&FieldPath::parse("inputs_json[data][k]")),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn missing_file_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "ghost".to_string(),
            FileInput {
                path: "ghost.md".to_string(),
                kind: FileInputKind::Text,
            },
        );
        let mut ctx = StageContext::new(BTreeMap::new());
        let err = ctx.load_file_inputs(dir.path(), &inputs).await.unwrap_err();
        assert!(matches!(err, ContextError::MissingFileInput { .. }));
        assert_eq!(err.kind(), "missing_file_input");
    }
}
