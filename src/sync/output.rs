//! Output path patterns
//!
//! A target's `output` is either a literal workspace-relative path or a
//! pattern such as `src/commands/{command|snake_case}.rs`. Placeholders are
//! filled from a grouped item, optionally through a registry filter, and the
//! result is confined to the workspace.

use serde_json::{Map, Value};
use std::fmt;

use crate::template::filters::FilterRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { field: String, filter: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Rejects paths that would leave the workspace.
fn check_relative(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    if path.starts_with('/') || path.starts_with('\\') || path.get(1..2) == Some(":") {
        return Err(format!("`{path}` must be relative to the workspace root"));
    }
    for part in path.split(['/', '\\']) {
        if part == ".." {
            return Err(format!("`{path}` must not contain `..`"));
        }
    }
    Ok(())
}

/// Placeholder values become a single path segment.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl OutputPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(format!("unclosed placeholder in `{raw}`"));
                    }
                    let (field, filter) = match inner.split_once('|') {
                        Some((field, filter)) => (field.trim(), Some(filter.trim())),
                        None => (inner.trim(), None),
                    };
                    if field.is_empty() || !field.chars().all(is_field_char) {
                        return Err(format!("invalid placeholder `{{{inner}}}` in `{raw}`"));
                    }
                    if filter.is_some_and(|f| f.is_empty() || !f.chars().all(is_field_char)) {
                        return Err(format!("invalid filter in placeholder `{{{inner}}}`"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder {
                        field: field.to_string(),
                        filter: filter.map(str::to_string),
                    });
                }
                '}' => return Err(format!("unmatched `}}` in `{raw}`")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        check_relative(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_templated(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder { .. }))
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder { field, .. } => Some(field.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder {
                filter: Some(filter),
                ..
            } => Some(filter.as_str()),
            _ => None,
        })
    }

    /// Fills placeholders from `item`. Fails on a missing or non-scalar
    /// field and on a value that sanitizes to nothing usable.
    pub fn expand(&self, item: &Map<String, Value>, filters: &FilterRegistry) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { field, filter } => {
                    let raw = match item.get(field) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Number(n)) => n.to_string(),
                        Some(Value::Bool(b)) => b.to_string(),
                        Some(other) => {
                            return Err(format!("field `{field}` is not a scalar: {other}"));
                        }
                        None => return Err(format!("item has no field `{field}`")),
                    };
                    let value = match filter {
                        Some(name) => filters
                            .apply(name, &raw)
                            .ok_or_else(|| format!("filter `{name}` is not enabled"))?,
                        None => raw,
                    };
                    let value = sanitize(&value);
                    if value.is_empty() || value == "." || value == ".." {
                        return Err(format!("field `{field}` expands to an unusable path segment"));
                    }
                    out.push_str(&value);
                }
            }
        }
        check_relative(&out)?;
        Ok(out)
    }
}
