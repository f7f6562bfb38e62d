//! Closed registry of template filters.
//!
//! Filters are named pure string functions. The set is fixed at compile time;
//! configuration may only select a subset, and unknown names are rejected
//! when the configuration is loaded. The same functions back the
//! `{field|filter}` placeholders in output path patterns.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub type FilterFn = fn(&str) -> String;

#[derive(Debug, Clone)]
pub struct FilterRegistry {
    filters: BTreeMap<&'static str, FilterFn>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN: &[(&str, FilterFn)] = &[
    ("snake_case", snake_case),
    ("camel_case", camel_case),
    ("pascal_case", pascal_case),
    ("kebab_case", kebab_case),
    ("shouty_snake_case", shouty_snake_case),
    ("local_name", local_name),
    ("rust_type", rust_type),
    ("python_type", python_type),
];

impl FilterRegistry {
    pub fn builtin() -> Self {
        Self {
            filters: BUILTIN.iter().copied().collect(),
        }
    }

    /// The registry restricted to `names`, or every filter for `None`.
    /// Returns the unknown names on failure.
    pub fn select(names: Option<&[String]>) -> Result<Self, Vec<String>> {
        let all = Self::builtin();
        let Some(names) = names else {
            return Ok(all);
        };
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| !all.contains(n))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(unknown);
        }
        Ok(Self {
            filters: all
                .filters
                .into_iter()
                .filter(|(name, _)| names.iter().any(|n| n == name))
                .collect(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.keys().copied().collect()
    }

    pub fn apply(&self, name: &str, input: &str) -> Option<String> {
        self.filters.get(name).map(|f| f(input))
    }

    pub fn register_into(&self, tera: &mut tera::Tera) {
        for (name, filter) in &self.filters {
            let filter = *filter;
            let label = *name;
            tera.register_filter(
                name,
                move |value: &Value, _args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let input = match value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(tera::Error::msg(format!(
                                "filter `{label}` expects a string, got {other}"
                            )));
                        }
                    };
                    Ok(Value::String(filter(&input)))
                },
            );
        }
    }
}

// =============================================================================
// Case conversion
// =============================================================================

/// Splits on non-alphanumerics and on case boundaries, keeping acronyms
/// together: `HTTPServer2Config` -> `HTTP`, `Server2`, `Config`.
fn words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    for chunk in input.split(|c: char| !c.is_alphanumeric()) {
        let chars: Vec<char> = chunk.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            let boundary = i > 0 && c.is_uppercase() && {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            };
            if boundary && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

pub fn snake_case(input: &str) -> String {
    words(input)
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn kebab_case(input: &str) -> String {
    words(input)
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn shouty_snake_case(input: &str) -> String {
    words(input)
        .iter()
        .map(|w| w.to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn pascal_case(input: &str) -> String {
    words(input).iter().map(|w| capitalize(w)).collect()
}

pub fn camel_case(input: &str) -> String {
    let mut out = String::new();
    for (i, word) in words(input).iter().enumerate() {
        if i == 0 {
            out.push_str(&word.to_lowercase());
        } else {
            out.push_str(&capitalize(word));
        }
    }
    out
}

/// Fragment or last path segment of an IRI; other input passes through.
pub fn local_name(input: &str) -> String {
    let trimmed = input.trim_start_matches('<').trim_end_matches('>');
    let tail = trimmed
        .rsplit(['#', '/'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(trimmed);
    match tail.rsplit_once(':') {
        Some((prefix, local)) if !prefix.contains('/') => local.to_string(),
        _ => tail.to_string(),
    }
}

// =============================================================================
// Type mapping
// =============================================================================

pub fn rust_type(input: &str) -> String {
    match local_name(input).as_str() {
        "boolean" | "bool" | "Flag" => "bool",
        "integer" | "long" | "int" | "Integer" => "i64",
        "short" => "i16",
        "byte" => "i8",
        "nonNegativeInteger" | "unsignedLong" | "unsignedInt" | "positiveInteger" => "u64",
        "decimal" | "double" | "Float" => "f64",
        "float" => "f32",
        "Path" | "path" => "std::path::PathBuf",
        _ => "String",
    }
    .to_string()
}

pub fn python_type(input: &str) -> String {
    match local_name(input).as_str() {
        "boolean" | "bool" | "Flag" => "bool",
        "integer" | "long" | "int" | "short" | "byte" | "Integer" | "nonNegativeInteger"
        | "unsignedLong" | "unsignedInt" | "positiveInteger" => "int",
        "decimal" | "double" | "float" | "Float" => "float",
        "Path" | "path" => "Path",
        _ => "str",
    }
    .to_string()
}
