//! Specification graphs and Stage 1 (normalization)
//!
//! A [`Specification`] is an immutable RDF graph loaded from Turtle files and
//! identified by the hash of those files. [`normalize`] checks it against a
//! [`ShapeSet`](shacl::ShapeSet) and, when every constraint holds, wraps the
//! same graph (no copy) in a [`ValidatedSpec`] carrying the hash of the
//! (specification, shapes) pair.

pub mod cache;
pub mod shacl;

use oxigraph::model::Term;
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

pub use cache::LoadCache;
pub use shacl::{Severity, ShapeSet, ShapeViolation};

use crate::codegen::hash;
use crate::error::{PipelineError, ValidationError};

/// Identity of one input file: workspace key plus content hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceFile {
    pub key: String,
    pub hash: String,
}

pub(crate) fn combined_hash(sources: &[SourceFile]) -> String {
    let mut sorted: Vec<&SourceFile> = sources.iter().collect();
    sorted.sort();
    hash::hash_parts(
        sorted
            .into_iter()
            .flat_map(|s| [s.key.as_bytes(), s.hash.as_bytes()]),
    )
}

/// Parses each file into `store`, returning their identities.
pub(crate) fn load_store(
    store: &Store,
    files: &[(PathBuf, String)],
) -> Result<Vec<SourceFile>, PipelineError> {
    let mut sources = Vec::with_capacity(files.len());
    for (path, key) in files {
        let content = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        store
            .load_from_reader(oxigraph::io::RdfFormat::Turtle, content.as_slice())
            .map_err(|e| PipelineError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        sources.push(SourceFile {
            key: key.clone(),
            hash: hash::hash_bytes(&content),
        });
    }
    Ok(sources)
}

/// Runs a SELECT query and collects every solution as variable → term.
pub(crate) fn select(store: &Store, query: &str) -> Result<Vec<BTreeMap<String, Term>>, String> {
    let results = SparqlEvaluator::new()
        .parse_query(query)
        .map_err(|e| e.to_string())?
        .on_store(store)
        .execute()
        .map_err(|e| e.to_string())?;
    let QueryResults::Solutions(solutions) = results else {
        return Err("expected a SELECT query".to_string());
    };
    let mut rows = Vec::new();
    for solution in solutions {
        let solution = solution.map_err(|e| e.to_string())?;
        rows.push(
            solution
                .iter()
                .map(|(var, term)| (var.as_str().to_string(), term.clone()))
                .collect(),
        );
    }
    Ok(rows)
}

// =============================================================================
// Specification
// =============================================================================

pub struct Specification {
    store: Store,
    sources: Vec<SourceFile>,
    hash: String,
    modified: Option<SystemTime>,
}

impl std::fmt::Debug for Specification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("sources", &self.sources)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

impl Specification {
    /// Loads Turtle files; `files` pairs each resolved path with its key.
    pub fn load(files: &[(PathBuf, String)]) -> Result<Self, PipelineError> {
        let store = Store::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
        let sources = load_store(&store, files)?;
        let modified = files
            .iter()
            .filter_map(|(path, _)| fs::metadata(path).and_then(|m| m.modified()).ok())
            .max();
        tracing::debug!(files = files.len(), "specification loaded");
        Ok(Self {
            store,
            hash: combined_hash(&sources),
            sources,
            modified,
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
        let sources = vec![SourceFile {
            key: label.to_string(),
            hash: hash::hash_str(turtle),
        }];
        Ok(Self {
            store,
            hash: combined_hash(&sources),
            sources,
            modified: None,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sources(&self) -> &[SourceFile] {
        &self.sources
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Newest modification time among the source files.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }
}

// =============================================================================
// Stage 1
// =============================================================================

/// A specification that satisfied its shapes.
#[derive(Debug, Clone)]
pub struct ValidatedSpec {
    spec: Arc<Specification>,
    hash: String,
    warnings: Vec<ShapeViolation>,
}

impl ValidatedSpec {
    pub fn spec(&self) -> &Arc<Specification> {
        &self.spec
    }

    /// Hash of the (specification, shapes) pair.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Non-fatal results (`sh:Warning`, `sh:Info`).
    pub fn warnings(&self) -> &[ShapeViolation] {
        &self.warnings
    }
}

pub fn normalize(spec: Arc<Specification>, shapes: &ShapeSet) -> Result<ValidatedSpec, PipelineError> {
    let results = shapes.validate(&spec)?;
    let (violations, warnings): (Vec<_>, Vec<_>) = results
        .into_iter()
        .partition(|r| r.severity == Severity::Violation);

    for warning in &warnings {
        tracing::warn!(
            focus = %warning.focus_node,
            shape = %warning.shape,
            constraint = %warning.constraint,
            "{}",
            warning.message
        );
    }
    if !violations.is_empty() {
        return Err(ValidationError { violations }.into());
    }

    let hash = hash::hash_parts([spec.hash().as_bytes(), shapes.hash().as_bytes()]);
    Ok(ValidatedSpec {
        spec,
        hash,
        warnings,
    })
}
