// =============================================================================
// SPARQL Result Reshaping
// =============================================================================
// Flat, ordered solutions become the nested record handed to templates. The
// transform is pure and total over row sets: the only failure is a row with
// no binding for the declared primary key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{BindingValue, Row, RowSet};
use crate::codegen::hash::canonical_json;
use crate::error::QueryError;

/// Grouping declaration for a target: rows sharing `key` collapse into one
/// item, and the projected `fields` of each row are nested under `children`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub key: String,
    #[serde(default = "default_children")]
    pub children: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_children() -> String {
    "children".to_string()
}

impl GroupSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            children: default_children(),
            fields: Vec::new(),
        }
    }

    pub fn with_children(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.children = name.into();
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

fn row_to_object(row: &Row) -> Map<String, Value> {
    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

/// Equality key over bindings that keeps term kinds and datatypes apart.
fn fingerprint<'a>(bindings: impl Iterator<Item = (&'a String, &'a BindingValue)>) -> String {
    canonical_json(&Value::Object(
        bindings.map(|(k, v)| (k.clone(), v.identity())).collect(),
    ))
}

struct ItemBuilder {
    fields: Map<String, Value>,
    children: Vec<Value>,
    seen_children: HashSet<String>,
}

/// Builds `{ "rows": [...], "items": [...] }`.
///
/// Exact duplicate rows (join fan-out) are dropped, keeping the first
/// occurrence. With a group, items appear in the order their key first
/// appears, which is the query's `ORDER BY` order; children keep row order.
pub fn reshape(rows: &RowSet, group: Option<&GroupSpec>, query_id: &str) -> Result<Value, QueryError> {
    let mut seen_rows = HashSet::new();
    let mut unique: Vec<(usize, &Row)> = Vec::with_capacity(rows.rows.len());
    for (index, row) in rows.rows.iter().enumerate() {
        if seen_rows.insert(fingerprint(row.iter())) {
            unique.push((index, row));
        }
    }

    let mut record = Map::new();
    record.insert(
        "rows".to_string(),
        Value::Array(
            unique
                .iter()
                .map(|(_, row)| Value::Object(row_to_object(row)))
                .collect(),
        ),
    );

    let Some(group) = group else {
        return Ok(Value::Object(record));
    };

    let mut order: Vec<String> = Vec::new();
    let mut items: std::collections::HashMap<String, ItemBuilder> = std::collections::HashMap::new();
    for (index, row) in unique {
        let Some(key_value) = row.get(&group.key) else {
            return Err(QueryError::MissingKey {
                query: query_id.to_string(),
                key: group.key.clone(),
                row_index: index,
                available: row.keys().cloned().collect(),
            });
        };
        let item_key = canonical_json(&key_value.identity());
        let builder = items.entry(item_key.clone()).or_insert_with(|| {
            order.push(item_key.clone());
            ItemBuilder {
                fields: Map::new(),
                children: Vec::new(),
                seen_children: HashSet::new(),
            }
        });

        for (name, value) in row {
            if group.fields.iter().any(|f| f == name) {
                continue;
            }
            builder
                .fields
                .entry(name.clone())
                .or_insert_with(|| value.to_json());
        }

        if group.fields.is_empty() {
            continue;
        }
        let child: Map<String, Value> = group
            .fields
            .iter()
            .filter_map(|f| row.get(f).map(|v| (f.clone(), v.to_json())))
            .collect();
        if child.is_empty() {
            continue;
        }
        let child_key = fingerprint(group.fields.iter().filter_map(|f| row.get_key_value(f)));
        if builder.seen_children.insert(child_key) {
            builder.children.push(Value::Object(child));
        }
    }

    let grouped: Vec<Value> = order
        .into_iter()
        .filter_map(|key| items.remove(&key))
        .map(|builder| {
            let mut fields = builder.fields;
            if !group.fields.is_empty() {
                fields.insert(group.children.clone(), Value::Array(builder.children));
            }
            Value::Object(fields)
        })
        .collect();
    record.insert("items".to_string(), Value::Array(grouped));

    Ok(Value::Object(record))
}
