//! Stage 3: template emission
//!
//! [`emit`] renders a record through a [`Renderable`] after injecting
//! provenance under `_provenance`. Rendering is pure: no file I/O, no clock.
//! The provenance timestamp comes from the newest source mtime so that an
//! unchanged source renders to identical bytes on every run.
//!
//! In strict mode an undefined variable fails with the missing name and the
//! names that were available. Lenient mode substitutes an empty string,
//! logs a warning and renders again.

pub mod filters;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::SystemTime;
use tera::{Context, Tera};

pub use filters::FilterRegistry;

use crate::codegen::hash;
use crate::config::EmitMode;
use crate::error::{PipelineError, TemplateError};

const PROVENANCE_KEY: &str = "_provenance";
const MAX_LENIENT_PASSES: usize = 64;

/// Metadata injected into every record before rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_hash: String,
    pub template_hash: String,
    pub query_hash: String,
    /// RFC 3339, derived from the newest source mtime.
    pub generated_at: String,
}

impl Provenance {
    pub fn timestamp_from(mtime: Option<SystemTime>) -> String {
        let time: chrono::DateTime<chrono::Utc> = mtime.unwrap_or(SystemTime::UNIX_EPOCH).into();
        time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

pub trait Renderable: Send + Sync {
    fn id(&self) -> &str;

    fn hash(&self) -> &str;

    fn render(&self, record: &Value) -> Result<Vec<u8>, TemplateError>;
}

pub struct TeraTemplate {
    id: String,
    hash: String,
    mode: EmitMode,
    tera: Tera,
}

impl std::fmt::Debug for TeraTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeraTemplate")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl TeraTemplate {
    /// Parses the template; syntax errors surface here, before any record
    /// is rendered.
    pub fn new(
        id: impl Into<String>,
        source: &str,
        filters: &FilterRegistry,
        mode: EmitMode,
    ) -> Result<Self, TemplateError> {
        let id = id.into();
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        filters.register_into(&mut tera);
        tera.add_raw_template(&id, source)
            .map_err(|e| TemplateError::Syntax {
                template: id.clone(),
                message: error_chain(&e),
            })?;
        Ok(Self {
            hash: hash::hash_str(source),
            id,
            mode,
            tera,
        })
    }

    pub fn from_file(
        path: &Path,
        key: &str,
        filters: &FilterRegistry,
        mode: EmitMode,
    ) -> Result<Self, PipelineError> {
        let source = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(Self::new(key, &source, filters, mode)?)
    }

    fn render_once(&self, record: &Value) -> Result<String, TemplateError> {
        let context = Context::from_value(record.clone()).map_err(|e| TemplateError::Render {
            template: self.id.clone(),
            message: error_chain(&e),
        })?;
        self.tera
            .render(&self.id, &context)
            .map_err(|e| self.classify(&e, record))
    }

    fn classify(&self, err: &tera::Error, record: &Value) -> TemplateError {
        let message = error_chain(err);
        if let Some(variable) = undefined_variable(&message) {
            return TemplateError::UndefinedVariable {
                template: self.id.clone(),
                variable,
                available: available_names(record),
            };
        }
        if let Some(filter) = failing_filter(&message) {
            return TemplateError::Filter {
                template: self.id.clone(),
                filter: Some(filter),
                message,
            };
        }
        TemplateError::Render {
            template: self.id.clone(),
            message,
        }
    }
}

impl Renderable for TeraTemplate {
    fn id(&self) -> &str {
        &self.id
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn render(&self, record: &Value) -> Result<Vec<u8>, TemplateError> {
        match self.mode {
            EmitMode::Strict => self.render_once(record).map(String::into_bytes),
            EmitMode::Lenient => {
                let mut record = record.clone();
                let mut filled = Vec::new();
                for _ in 0..MAX_LENIENT_PASSES {
                    match self.render_once(&record) {
                        Ok(text) => return Ok(text.into_bytes()),
                        Err(TemplateError::UndefinedVariable { variable, available, template }) => {
                            if filled.contains(&variable) || !fill_missing(&mut record, &variable) {
                                return Err(TemplateError::UndefinedVariable {
                                    template,
                                    variable,
                                    available,
                                });
                            }
                            tracing::warn!(
                                template = %self.id,
                                variable = %variable,
                                "undefined variable rendered as empty string"
                            );
                            filled.push(variable);
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(TemplateError::Render {
                    template: self.id.clone(),
                    message: format!("gave up after {MAX_LENIENT_PASSES} lenient substitutions"),
                })
            }
        }
    }
}

/// Renders `record` with provenance injected. The caller's record is not
/// modified.
pub fn emit(record: &Value, provenance: &Provenance, template: &dyn Renderable) -> Result<Vec<u8>, TemplateError> {
    let mut record = match record {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    let provenance = serde_json::to_value(provenance).map_err(|e| TemplateError::Render {
        template: template.id().to_string(),
        message: e.to_string(),
    })?;
    record.insert(PROVENANCE_KEY.to_string(), provenance);
    let bytes = template.render(&Value::Object(record))?;
    tracing::debug!(template = %template.id(), bytes = bytes.len(), "template rendered");
    Ok(bytes)
}

// =============================================================================
// Error inspection
// =============================================================================

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
        source = inner.source();
    }
    parts.join(": ")
}

fn between<'a>(message: &'a str, start: &str, end: char) -> Option<&'a str> {
    let begin = message.find(start)? + start.len();
    let rest = &message[begin..];
    let stop = rest.find(end)?;
    Some(&rest[..stop])
}

fn undefined_variable(message: &str) -> Option<String> {
    if !message.contains("not found in context") {
        return None;
    }
    between(message, "Variable `", '`').map(str::to_string)
}

fn failing_filter(message: &str) -> Option<String> {
    between(message, "Filter call '", '\'')
        .or_else(|| between(message, "Filter `", '`'))
        .map(str::to_string)
}

/// Top-level names plus the fields of objects inside top-level arrays.
fn available_names(record: &Value) -> Vec<String> {
    let mut names = std::collections::BTreeSet::new();
    if let Value::Object(map) = record {
        for (key, value) in map {
            names.insert(key.clone());
            if let Value::Array(items) = value {
                for item in items {
                    if let Value::Object(fields) = item {
                        for field in fields.keys() {
                            names.insert(format!("{key}[].{field}"));
                        }
                    }
                }
            }
        }
    }
    names.into_iter().collect()
}

/// Inserts `""` for a missing variable. A dotted name whose root exists is
/// filled at that path; otherwise the leaf is added to every object nested in
/// the record that lacks it, which covers loop variables. Returns whether
/// anything changed.
fn fill_missing(record: &mut Value, variable: &str) -> bool {
    let segments: Vec<&str> = variable.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return false;
    };

    if let Value::Object(map) = record {
        if parents.is_empty() {
            if map.contains_key(*leaf) {
                return false;
            }
            map.insert(leaf.to_string(), Value::String(String::new()));
            return true;
        }
        if map.contains_key(parents[0]) {
            let mut cursor = &mut *record;
            for segment in parents {
                let Some(next) = cursor.get_mut(*segment) else {
                    return false;
                };
                cursor = next;
            }
            if let Value::Object(target) = cursor {
                if target.contains_key(*leaf) {
                    return false;
                }
                target.insert(leaf.to_string(), Value::String(String::new()));
                return true;
            }
            return false;
        }
    }

    fill_nested(record, leaf, 0)
}

fn fill_nested(value: &mut Value, leaf: &str, depth: usize) -> bool {
    let mut changed = false;
    match value {
        Value::Object(map) => {
            if depth > 0 && !map.contains_key(leaf) {
                map.insert(leaf.to_string(), Value::String(String::new()));
                changed = true;
            }
            for (key, child) in map.iter_mut() {
                if key != PROVENANCE_KEY {
                    changed |= fill_nested(child, leaf, depth + 1);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                changed |= fill_nested(item, leaf, depth + 1);
            }
        }
        _ => {}
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn provenance() -> Provenance {
        Provenance {
            source_hash: "s".repeat(64),
            template_hash: "t".repeat(64),
            query_hash: "q".repeat(64),
            generated_at: Provenance::timestamp_from(None),
        }
    }

    fn template(source: &str, mode: EmitMode) -> TeraTemplate {
        TeraTemplate::new("command.rs.tera", source, &FilterRegistry::builtin(), mode).unwrap()
    }

    #[test]
    fn renders_record_with_provenance() {
        let tpl = template(
            "// generated at {{ _provenance.generated_at }}\n{% for item in items %}pub fn {{ item.command | snake_case }}() {}\n{% endfor %}",
            EmitMode::Strict,
        );
        let record = json!({"items": [{"command": "dryRun"}, {"command": "validate"}]});
        let out = emit(&record, &provenance(), &tpl).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "// generated at 1970-01-01T00:00:00Z\npub fn dry_run() {}\npub fn validate() {}\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let tpl = template("{% for r in rows %}{{ r.a }},{% endfor %}", EmitMode::Strict);
        let record = json!({"rows": [{"a": 1}, {"a": 2}]});
        let first = emit(&record, &provenance(), &tpl).unwrap();
        let second = emit(&record, &provenance(), &tpl).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn strict_mode_names_missing_variable() {
        let tpl = template("{{ title }}", EmitMode::Strict);
        let err = emit(&json!({"rows": []}), &provenance(), &tpl).unwrap_err();
        assert_matches!(
            err,
            TemplateError::UndefinedVariable { ref variable, ref available, .. }
                if variable == "title" && available.contains(&"rows".to_string())
        );
    }

    #[test]
    fn lenient_mode_substitutes_empty_strings() {
        let tpl = template(
            "[{{ title }}]{% for item in items %}<{{ item.description }}>{% endfor %}",
            EmitMode::Lenient,
        );
        let record = json!({"items": [{"name": "a", "description": "first"}, {"name": "b"}]});
        let out = emit(&record, &provenance(), &tpl).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[]<first><>");
    }

    #[test]
    fn syntax_errors_surface_at_construction() {
        let err = TeraTemplate::new("bad.tera", "{% for x in %}", &FilterRegistry::builtin(), EmitMode::Strict)
            .unwrap_err();
        assert_matches!(err, TemplateError::Syntax { ref template, .. } if template == "bad.tera");
    }

    #[test]
    fn filters_outside_the_registry_are_unavailable() {
        let restricted = FilterRegistry::select(Some(&["snake_case".to_string()])).unwrap();
        let result = TeraTemplate::new("t", "{{ name | camel_case }}", &restricted, EmitMode::Strict)
            .and_then(|tpl| emit(&json!({"name": "a_b"}), &provenance(), &tpl));
        assert!(result.is_err());
    }

    #[test]
    fn filter_failures_are_classified() {
        let tpl = template("{{ items | snake_case }}", EmitMode::Strict);
        let err = emit(&json!({"items": [1]}), &provenance(), &tpl).unwrap_err();
        assert_matches!(err, TemplateError::Filter { .. });
    }

    #[test]
    fn generated_at_uses_mtime() {
        let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(Provenance::timestamp_from(Some(mtime)), "2023-11-14T22:13:20Z");
    }
}
