//! Prompt template rendering and field extraction.
//!
//! Templates use `{field}` placeholders with optional bracket indexing
//! (`{stage_outputs[list_items]}`, `{item[title]}`, nested indices allowed)
//! and `{{` / `}}` as literal brace escapes. The engine needs exactly two
//! operations from this module: the set of fields a template references
//! (for dependency scanning and the `context_used` audit) and a strict
//! render that fails on any unresolvable field.

use serde_json::Value;

/// Errors from template parsing or rendering.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// A `{` without a matching `}` (or vice versa).
    #[error("unbalanced braces in template at byte {0}")]
    UnbalancedBraces(usize),

    /// A referenced field was not available in the context.
    #[error("unresolved context reference: '{0}'")]
    Unresolved(String),
}

/// A parsed field expression: a root name plus zero or more bracket indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: String,
    pub indices: Vec<String>,
}

impl FieldPath {
    /// Parse `name`, `name[key]`, `name[key][key2]`.
    pub fn parse(expr: &str) -> Self {
        match expr.find('[') {
            None => FieldPath {
                root: expr.to_string(),
                indices: Vec::new(),
            },
            Some(open) => {
                let root = expr[..open].to_string();
                let mut indices = Vec::new();
                let mut rest = &expr[open..];
                while let Some(start) = rest.find('[') {
                    match rest[start..].find(']') {
                        Some(end) => {
                            indices.push(rest[start + 1..start + end].to_string());
                            rest = &rest[start + end + 1..];
                        }
                        None => break,
                    }
                }
                FieldPath { root, indices }
            }
        }
    }
}

/// Raw field expressions referenced by a template, in order of appearance.
///
/// Duplicates are preserved; callers that need a set can dedup.
pub fn extract_fields(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut fields = Vec::new();
    for_each_segment(template, |segment| {
        if let Segment::Field(expr) = segment {
            fields.push(expr.to_string());
        }
        Ok(())
    })?;
    Ok(fields)
}

/// Render a template against a context lookup.
///
/// `lookup` resolves a parsed field path to a value; returning `None` fails
/// the render with [`TemplateError::Unresolved`] naming the raw expression.
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&FieldPath) -> Option<Value>,
{
    let mut out = String::with_capacity(template.len());
    for_each_segment(template, |segment| {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field(expr) => {
                let path = FieldPath::parse(expr);
                let value = lookup(&path)
                    .ok_or_else(|| TemplateError::Unresolved(expr.to_string()))?;
                out.push_str(&value_to_string(&value));
            }
        }
        Ok(())
    })?;
    Ok(out)
}

/// Convert a JSON value to its template string form: strings render bare,
/// scalars as their JSON token, arrays/objects as pretty JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Field(&'a str),
}

fn for_each_segment<'a, F>(template: &'a str, mut visit: F) -> Result<(), TemplateError>
where
    F: FnMut(Segment<'a>) -> Result<(), TemplateError>,
{
    let bytes = template.as_bytes();
    let mut pos = 0;
    let mut literal_start = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'{' => {
                if bytes.get(pos + 1) == Some(&b'{') {
                    // Escaped literal brace.
                    visit(Segment::Literal(&template[literal_start..pos + 1]))?;
                    pos += 2;
                    literal_start = pos;
                    continue;
                }
                if literal_start < pos {
                    visit(Segment::Literal(&template[literal_start..pos]))?;
                }
                let close = template[pos + 1..]
                    .find('}')
                    .ok_or(TemplateError::UnbalancedBraces(pos))?;
                visit(Segment::Field(&template[pos + 1..pos + 1 + close]))?;
                pos += close + 2;
                literal_start = pos;
            }
            b'}' => {
                if bytes.get(pos + 1) == Some(&b'}') {
                    visit(Segment::Literal(&template[literal_start..pos + 1]))?;
                    pos += 2;
                    literal_start = pos;
                } else {
                    return Err(TemplateError::UnbalancedBraces(pos));
                }
            }
            _ => pos += 1,
        }
    }

    if literal_start < bytes.len() {
        visit(Segment::Literal(&template[literal_start..]))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn simple_lookup(path: &FieldPath) -> Option<Value> {
        match (path.root.as_str(), path.indices.as_slice()) {
            ("topic", []) => Some(json!("chess")),
            ("count", []) => Some(json!(5)),
            ("item", []) => Some(json!({"name": "alpha"})),
            ("item", [key]) if key == "name" => Some(json!("alpha")),
            ("stage_outputs", [id]) if id == "intro" => Some(json!("Intro text.")),
            _ => None,
        }
    }

    #[test]
    fn extracts_fields_in_order() {
        let fields =
            extract_fields("A {topic} with {stage_outputs[intro]} and {item[name]}.").unwrap();
        assert_eq!(fields, vec!["topic", "stage_outputs[intro]", "item[name]"]);
    }

    #[test]
    fn extract_ignores_escaped_braces() {
        let fields = extract_fields("literal {{braces}} only").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn field_path_parses_nested_indices() {
        let path = FieldPath::parse("stage_json[list_items][items]");
        assert_eq!(path.root, "stage_json");
        assert_eq!(path.indices, vec!["list_items", "items"]);

        let bare = FieldPath::parse("topic");
        assert_eq!(bare.root, "topic");
        assert!(bare.indices.is_empty());
    }

    #[test]
    fn renders_values_and_escapes() {
        let out = render("{{n}} {topic} x{count} {item[name]}", simple_lookup).unwrap();
        assert_eq!(out, "{n} chess x5 alpha");
    }

    #[test]
    fn renders_objects_as_pretty_json() {
        let out = render("{item}", simple_lookup).unwrap();
        assert!(out.contains("\"name\": \"alpha\""));
    }

    #[test]
    fn unresolved_reference_names_the_expression() {
        let err = render("{missing_thing}", simple_lookup).unwrap_err();
        match err {
            TemplateError::Unresolved(expr) => assert_eq!(expr, "missing_thing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_braces_are_rejected() {
        assert!(matches!(
            extract_fields("oops {topic"),
            Err(TemplateError::UnbalancedBraces(_))
        ));
        assert!(matches!(
            extract_fields("oops } alone"),
            Err(TemplateError::UnbalancedBraces(_))
        ));
    }

    #[test]
    fn value_to_string_forms() {
        assert_eq!(value_to_string(&json!("s")), "s");
        assert_eq!(value_to_string(&json!(null)), "null");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(3.5)), "3.5");
    }
}
