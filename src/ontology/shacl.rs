//! SHACL shape constraints
//!
//! Shapes are read from Turtle into a [`ShapeSet`] and checked against a
//! specification graph with SPARQL. The supported subset:
//!
//! - targets: `sh:targetClass` (including subclasses), `sh:targetNode`,
//!   `sh:targetSubjectsOf`, `sh:targetObjectsOf`
//! - property constraints on IRI paths: `sh:minCount`, `sh:maxCount`,
//!   `sh:datatype`, `sh:class`, `sh:pattern` (with `sh:flags "i"`),
//!   `sh:minLength`, `sh:maxLength`, `sh:in`
//! - `sh:message` and `sh:severity` on the property or its node shape
//!
//! Results are returned sorted by focus node, path, constraint and value so a
//! report is identical between runs.

use oxigraph::model::Term;
use oxigraph::store::Store;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::{SourceFile, Specification, load_store, select};
use crate::codegen::hash;
use crate::error::PipelineError;

const SH_NS: &str = "http://www.w3.org/ns/shacl#";
const PREFIXES: &str = "PREFIX sh: <http://www.w3.org/ns/shacl#>\n\
PREFIX rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#>\n\
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>\n";

// =============================================================================
// Severity Levels
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Violation,
}

impl Severity {
    pub fn from_iri(iri: &str) -> Self {
        match iri.strip_prefix(SH_NS) {
            Some("Info") => Severity::Info,
            Some("Warning") => Severity::Warning,
            _ => Severity::Violation,
        }
    }
}

// =============================================================================
// Violations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeViolation {
    pub focus_node: String,
    pub shape: String,
    pub path: Option<String>,
    /// Constraint component, e.g. `minCount`.
    pub constraint: String,
    pub value: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl ShapeViolation {
    fn sort_key(&self) -> (&str, Option<&str>, &str, Option<&str>, &str) {
        (
            &self.focus_node,
            self.path.as_deref(),
            &self.constraint,
            self.value.as_deref(),
            &self.shape,
        )
    }
}

impl fmt::Display for ShapeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.focus_node)?;
        if let Some(path) = &self.path {
            write!(f, " {path}")?;
        }
        write!(f, ": {} ({} from {})", self.message, self.constraint, self.shape)?;
        if let Some(value) = &self.value {
            write!(f, " value {value}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Shape model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Class(String),
    Node(String),
    SubjectsOf(String),
    ObjectsOf(String),
}

impl TargetSelector {
    /// Graph pattern binding `?focus`.
    fn pattern(&self) -> String {
        match self {
            TargetSelector::Class(class) => {
                format!("?focus rdf:type/rdfs:subClassOf* {class} .")
            }
            TargetSelector::Node(node) => format!("VALUES ?focus {{ {node} }}"),
            TargetSelector::SubjectsOf(p) => format!("?focus {p} ?targetObject ."),
            TargetSelector::ObjectsOf(p) => format!("?targetSubject {p} ?focus ."),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropertyShape {
    /// The path predicate in N-Triples form.
    pub path: String,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    pub datatype: Option<String>,
    pub class: Option<String>,
    pub pattern: Option<Regex>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed: Option<BTreeSet<String>>,
    pub message: Option<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone)]
pub struct NodeShape {
    pub id: String,
    pub targets: Vec<TargetSelector>,
    pub properties: Vec<PropertyShape>,
    pub message: Option<String>,
    pub severity: Severity,
}

/// Parsed shapes plus the identity of the files they came from.
#[derive(Debug, Clone)]
pub struct ShapeSet {
    shapes: Vec<NodeShape>,
    sources: Vec<SourceFile>,
    hash: String,
}

impl Default for ShapeSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl ShapeSet {
    pub fn empty() -> Self {
        Self {
            shapes: Vec::new(),
            sources: Vec::new(),
            hash: hash::hash_str(""),
        }
    }

    /// Loads and parses shape files. `files` pairs the resolved path with its
    /// workspace key.
    pub fn load(files: &[(std::path::PathBuf, String)]) -> Result<Self, PipelineError> {
        if files.is_empty() {
            return Ok(Self::empty());
        }
        let store = Store::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
        let sources = load_store(&store, files)?;
        let shapes = parse_shapes(&store).map_err(|message| PipelineError::Parse {
            path: files[0].0.clone(),
            message,
        })?;
        Ok(Self {
            shapes,
            hash: super::combined_hash(&sources),
            sources,
        })
    }

    pub fn from_turtle(label: &str, turtle: &str) -> Result<Self, PipelineError> {
        let store = Store::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
        store
            .load_from_reader(oxigraph::io::RdfFormat::Turtle, turtle.as_bytes())
            .map_err(|e| PipelineError::Parse {
                path: label.into(),
                message: e.to_string(),
            })?;
        let shapes = parse_shapes(&store).map_err(|message| PipelineError::Parse {
            path: label.into(),
            message,
        })?;
        let sources = vec![SourceFile {
            key: label.to_string(),
            hash: hash::hash_str(turtle),
        }];
        Ok(Self {
            shapes,
            hash: super::combined_hash(&sources),
            sources,
        })
    }

    pub fn shapes(&self) -> &[NodeShape] {
        &self.shapes
    }

    pub fn sources(&self) -> &[SourceFile] {
        &self.sources
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Checks every constraint and returns all results, sorted.
    pub fn validate(&self, spec: &Specification) -> Result<Vec<ShapeViolation>, PipelineError> {
        let mut results = Vec::new();
        for shape in &self.shapes {
            for target in &shape.targets {
                for property in &shape.properties {
                    check_property(spec, shape, target, property, &mut results)?;
                }
            }
        }
        results.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        results.dedup();
        Ok(results)
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn literal_usize(term: Option<&Term>) -> Result<Option<usize>, String> {
    match term {
        None => Ok(None),
        Some(Term::Literal(lit)) => lit
            .value()
            .parse()
            .map(Some)
            .map_err(|_| format!("expected a non-negative integer, found {lit}")),
        Some(other) => Err(format!("expected a literal, found {other}")),
    }
}

fn literal_string(term: Option<&Term>) -> Option<String> {
    match term {
        Some(Term::Literal(lit)) => Some(lit.value().to_string()),
        _ => None,
    }
}

fn parse_shapes(store: &Store) -> Result<Vec<NodeShape>, String> {
    let mut shapes: BTreeMap<String, NodeShape> = BTreeMap::new();

    let target_query = format!(
        "{PREFIXES}SELECT ?shape ?kind ?target ?message ?severity WHERE {{
            {{ ?shape sh:targetClass ?target BIND(\"class\" AS ?kind) }}
            UNION {{ ?shape sh:targetNode ?target BIND(\"node\" AS ?kind) }}
            UNION {{ ?shape sh:targetSubjectsOf ?target BIND(\"subjects\" AS ?kind) }}
            UNION {{ ?shape sh:targetObjectsOf ?target BIND(\"objects\" AS ?kind) }}
            OPTIONAL {{ ?shape sh:message ?message }}
            OPTIONAL {{ ?shape sh:severity ?severity }}
        }} ORDER BY ?shape ?kind ?target"
    );
    for row in select(store, &target_query)? {
        let Some(shape_term) = row.get("shape") else {
            continue;
        };
        let Some(target) = row.get("target").map(Term::to_string) else {
            continue;
        };
        let kind = literal_string(row.get("kind")).unwrap_or_default();
        let id = shape_term.to_string();
        let entry = shapes.entry(id.clone()).or_insert_with(|| NodeShape {
            id,
            targets: Vec::new(),
            properties: Vec::new(),
            message: literal_string(row.get("message")),
            severity: match row.get("severity") {
                Some(Term::NamedNode(n)) => Severity::from_iri(n.as_str()),
                _ => Severity::Violation,
            },
        });
        let selector = match kind.as_str() {
            "class" => TargetSelector::Class(target),
            "node" => TargetSelector::Node(target),
            "subjects" => TargetSelector::SubjectsOf(target),
            _ => TargetSelector::ObjectsOf(target),
        };
        if !entry.targets.contains(&selector) {
            entry.targets.push(selector);
        }
    }

    let mut allowed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let in_query = format!(
        "{PREFIXES}SELECT ?property ?value WHERE {{
            ?property sh:in ?list . ?list rdf:rest*/rdf:first ?value .
        }} ORDER BY ?property ?value"
    );
    for row in select(store, &in_query)? {
        if let (Some(property), Some(value)) = (row.get("property"), row.get("value")) {
            allowed
                .entry(property.to_string())
                .or_default()
                .insert(value.to_string());
        }
    }

    let property_query = format!(
        "{PREFIXES}SELECT ?shape ?property ?path ?minCount ?maxCount ?datatype ?class
                ?pattern ?flags ?minLength ?maxLength ?message ?severity WHERE {{
            ?shape sh:property ?property . ?property sh:path ?path .
            FILTER(isIRI(?path))
            OPTIONAL {{ ?property sh:minCount ?minCount }}
            OPTIONAL {{ ?property sh:maxCount ?maxCount }}
            OPTIONAL {{ ?property sh:datatype ?datatype }}
            OPTIONAL {{ ?property sh:class ?class }}
            OPTIONAL {{ ?property sh:pattern ?pattern }}
            OPTIONAL {{ ?property sh:flags ?flags }}
            OPTIONAL {{ ?property sh:minLength ?minLength }}
            OPTIONAL {{ ?property sh:maxLength ?maxLength }}
            OPTIONAL {{ ?property sh:message ?message }}
            OPTIONAL {{ ?property sh:severity ?severity }}
        }} ORDER BY ?shape ?path ?property"
    );
    let mut seen_properties = BTreeSet::new();
    for row in select(store, &property_query)? {
        let (Some(shape), Some(property), Some(path)) =
            (row.get("shape"), row.get("property"), row.get("path"))
        else {
            continue;
        };
        let Some(node_shape) = shapes.get_mut(&shape.to_string()) else {
            // Shapes without targets never select a focus node.
            continue;
        };
        let property_id = property.to_string();
        if !seen_properties.insert((node_shape.id.clone(), property_id.clone())) {
            continue;
        }

        let pattern = match literal_string(row.get("pattern")) {
            Some(source) => {
                let flags = literal_string(row.get("flags")).unwrap_or_default();
                let source = if flags.contains('i') {
                    format!("(?i){source}")
                } else {
                    source
                };
                Some(Regex::new(&source).map_err(|e| format!("invalid sh:pattern: {e}"))?)
            }
            None => None,
        };

        node_shape.properties.push(PropertyShape {
            path: path.to_string(),
            min_count: literal_usize(row.get("minCount"))?,
            max_count: literal_usize(row.get("maxCount"))?,
            datatype: match row.get("datatype") {
                Some(Term::NamedNode(n)) => Some(n.as_str().to_string()),
                _ => None,
            },
            class: row.get("class").map(Term::to_string),
            pattern,
            min_length: literal_usize(row.get("minLength"))?,
            max_length: literal_usize(row.get("maxLength"))?,
            allowed: allowed.get(&property_id).cloned(),
            message: literal_string(row.get("message")),
            severity: match row.get("severity") {
                Some(Term::NamedNode(n)) => Some(Severity::from_iri(n.as_str())),
                _ => None,
            },
        });
    }

    Ok(shapes.into_values().collect())
}

// =============================================================================
// Checking
// =============================================================================

fn lexical_form(term: &Term) -> Option<String> {
    match term {
        Term::NamedNode(n) => Some(n.as_str().to_string()),
        Term::Literal(l) => Some(l.value().to_string()),
        _ => None,
    }
}

fn check_property(
    spec: &Specification,
    shape: &NodeShape,
    target: &TargetSelector,
    property: &PropertyShape,
    results: &mut Vec<ShapeViolation>,
) -> Result<(), PipelineError> {
    let query_err = |message: String| PipelineError::Internal(format!(
        "shape {} could not be evaluated: {message}",
        shape.id
    ));
    let severity = property.severity.unwrap_or(shape.severity);
    let violation = |focus: &str, constraint: &str, value: Option<String>, default: String| {
        ShapeViolation {
            focus_node: focus.to_string(),
            shape: shape.id.clone(),
            path: Some(property.path.clone()),
            constraint: constraint.to_string(),
            value,
            message: property
                .message
                .clone()
                .or_else(|| shape.message.clone())
                .unwrap_or(default),
            severity,
        }
    };

    let values_query = format!(
        "{PREFIXES}SELECT DISTINCT ?focus ?value WHERE {{
            {{ {} }}
            OPTIONAL {{ ?focus {} ?value }}
        }} ORDER BY ?focus ?value",
        target.pattern(),
        property.path
    );
    let mut by_focus: BTreeMap<String, Vec<Term>> = BTreeMap::new();
    for row in select(spec.store(), &values_query).map_err(query_err)? {
        let Some(focus) = row.get("focus") else {
            continue;
        };
        let values = by_focus.entry(focus.to_string()).or_default();
        if let Some(value) = row.get("value") {
            values.push(value.clone());
        }
    }

    for (focus, values) in &by_focus {
        let count = values.len();
        if let Some(min) = property.min_count {
            if count < min {
                results.push(violation(
                    focus,
                    "minCount",
                    None,
                    format!("expected at least {min} value(s) for {}, found {count}", property.path),
                ));
            }
        }
        if let Some(max) = property.max_count {
            if count > max {
                results.push(violation(
                    focus,
                    "maxCount",
                    None,
                    format!("expected at most {max} value(s) for {}, found {count}", property.path),
                ));
            }
        }

        for value in values {
            let shown = Some(value.to_string());
            if let Some(datatype) = &property.datatype {
                let matches = matches!(value, Term::Literal(l) if l.datatype().as_str() == datatype);
                if !matches {
                    results.push(violation(
                        focus,
                        "datatype",
                        shown.clone(),
                        format!("value must have datatype <{datatype}>"),
                    ));
                }
            }

            let lexical = lexical_form(value);
            if let Some(pattern) = &property.pattern {
                if !lexical.as_deref().is_some_and(|text| pattern.is_match(text)) {
                    results.push(violation(
                        focus,
                        "pattern",
                        shown.clone(),
                        format!("value must match pattern `{}`", pattern.as_str()),
                    ));
                }
            }
            let length = lexical.as_deref().map(|text| text.chars().count());
            if let Some(min) = property.min_length {
                if length.is_none_or(|len| len < min) {
                    results.push(violation(
                        focus,
                        "minLength",
                        shown.clone(),
                        format!("value must be at least {min} character(s) long"),
                    ));
                }
            }
            if let Some(max) = property.max_length {
                if length.is_none_or(|len| len > max) {
                    results.push(violation(
                        focus,
                        "maxLength",
                        shown.clone(),
                        format!("value must be at most {max} character(s) long"),
                    ));
                }
            }
            if let Some(allowed) = &property.allowed {
                if !allowed.contains(&value.to_string()) {
                    results.push(violation(
                        focus,
                        "in",
                        shown.clone(),
                        "value is not one of the allowed values".to_string(),
                    ));
                }
            }
        }
    }

    if let Some(class) = &property.class {
        let class_query = format!(
            "{PREFIXES}SELECT DISTINCT ?focus ?value WHERE {{
                {{ {} }}
                ?focus {} ?value .
                FILTER NOT EXISTS {{ ?value rdf:type/rdfs:subClassOf* {class} }}
            }} ORDER BY ?focus ?value",
            target.pattern(),
            property.path
        );
        for row in select(spec.store(), &class_query).map_err(query_err)? {
            if let (Some(focus), Some(value)) = (row.get("focus"), row.get("value")) {
                results.push(violation(
                    &focus.to_string(),
                    "class",
                    Some(value.to_string()),
                    format!("value must be an instance of {class}"),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPES: &str = r#"
@prefix sh: <http://www.w3.org/ns/shacl#> .
@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix ex: <http://example.org/cli#> .

ex:CommandShape a sh:NodeShape ;
    sh:targetClass ex:Command ;
    sh:property [
        sh:path rdfs:label ;
        sh:minCount 1 ;
        sh:maxCount 1 ;
        sh:datatype xsd:string ;
        sh:pattern "^[a-z][a-z0-9-]*$" ;
        sh:message "command requires exactly one kebab-case label" ;
    ] ;
    sh:property [
        sh:path ex:argument ;
        sh:class ex:Argument ;
    ] .

ex:ArgumentShape a sh:NodeShape ;
    sh:targetClass ex:Argument ;
    sh:property [
        sh:path ex:argType ;
        sh:minCount 1 ;
        sh:in ( "Path" "String" "Integer" ) ;
    ] ;
    sh:property [
        sh:path rdfs:comment ;
        sh:maxLength 20 ;
        sh:severity sh:Warning ;
    ] .
"#;

    fn spec(turtle: &str) -> Specification {
        Specification::from_turtle("spec.ttl", turtle).unwrap()
    }

    fn shapes() -> ShapeSet {
        ShapeSet::from_turtle("shapes.ttl", SHAPES).unwrap()
    }

    #[test]
    fn parses_targets_and_properties() {
        let shapes = shapes();
        assert_eq!(shapes.shapes().len(), 2);
        let command = shapes
            .shapes()
            .iter()
            .find(|s| s.id.contains("CommandShape"))
            .unwrap();
        assert_eq!(
            command.targets,
            vec![TargetSelector::Class("<http://example.org/cli#Command>".into())]
        );
        assert_eq!(command.properties.len(), 2);
        let argument = shapes
            .shapes()
            .iter()
            .find(|s| s.id.contains("ArgumentShape"))
            .unwrap();
        let arg_type = argument
            .properties
            .iter()
            .find(|p| p.path.contains("argType"))
            .unwrap();
        assert_eq!(arg_type.allowed.as_ref().map(|a| a.len()), Some(3));
    }

    #[test]
    fn conforming_graph_has_no_results() {
        let data = spec(
            r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
ex:validate a ex:Command ; rdfs:label "validate" ; ex:argument ex:path .
ex:path a ex:Argument ; ex:argType "Path" .
"#,
        );
        assert!(shapes().validate(&data).unwrap().is_empty());
    }

    #[test]
    fn collects_all_violations_in_stable_order() {
        let data = spec(
            r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
ex:zeta a ex:Command ; ex:argument ex:orphan .
ex:alpha a ex:Command ; rdfs:label "Alpha" .
ex:path a ex:Argument ; ex:argType "Float" ;
    rdfs:comment "a comment that is far too long" .
"#,
        );
        let results = shapes().validate(&data).unwrap();
        let summary: Vec<(String, String)> = results
            .iter()
            .map(|r| (r.focus_node.clone(), r.constraint.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("<http://example.org/cli#alpha>".into(), "pattern".into()),
                ("<http://example.org/cli#path>".into(), "in".into()),
                ("<http://example.org/cli#path>".into(), "maxLength".into()),
                ("<http://example.org/cli#zeta>".into(), "class".into()),
                ("<http://example.org/cli#zeta>".into(), "minCount".into()),
            ]
        );
        let label = results.iter().find(|r| r.constraint == "minCount").unwrap();
        assert_eq!(label.message, "command requires exactly one kebab-case label");
        let comment = results.iter().find(|r| r.constraint == "maxLength").unwrap();
        assert_eq!(comment.severity, Severity::Warning);
    }

    #[test]
    fn subclass_instances_are_targeted() {
        let data = spec(
            r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
ex:SubCommand rdfs:subClassOf ex:Command .
ex:nested a ex:SubCommand .
"#,
        );
        let results = shapes().validate(&data).unwrap();
        assert!(results
            .iter()
            .any(|r| r.focus_node.contains("nested") && r.constraint == "minCount"));
    }

    #[test]
    fn target_node_applies_even_without_statements() {
        let shapes = ShapeSet::from_turtle(
            "node.ttl",
            r#"
@prefix sh: <http://www.w3.org/ns/shacl#> .
@prefix ex: <http://example.org/cli#> .
ex:RootShape sh:targetNode ex:root ;
    sh:property [ sh:path ex:version ; sh:minCount 1 ] .
"#,
        )
        .unwrap();
        let results = shapes.validate(&spec("")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].focus_node, "<http://example.org/cli#root>");
    }

    #[test]
    fn shared_property_shape_applies_to_every_node_shape() {
        let shapes = ShapeSet::from_turtle(
            "shared.ttl",
            r#"
@prefix sh: <http://www.w3.org/ns/shacl#> .
@prefix ex: <http://example.org/cli#> .
ex:KindProp sh:path ex:kind ; sh:in ( "a" "b" ) .
ex:CommandShape sh:targetClass ex:Command ; sh:property ex:KindProp .
ex:ArgumentShape sh:targetClass ex:Argument ; sh:property ex:KindProp .
"#,
        )
        .unwrap();
        let data = spec(
            r#"
@prefix ex: <http://example.org/cli#> .
ex:c a ex:Command ; ex:kind "zzz" .
ex:x a ex:Argument ; ex:kind "zzz" .
"#,
        );
        let results = shapes.validate(&data).unwrap();
        let focus: Vec<&str> = results.iter().map(|r| r.focus_node.as_str()).collect();
        assert_eq!(
            focus,
            vec!["<http://example.org/cli#c>", "<http://example.org/cli#x>"]
        );
        assert!(results.iter().all(|r| r.constraint == "in"));
    }
}
