//! Error taxonomy for the generation pipeline
//!
//! Each stage has its own typed error. `PipelineError` is the union carried
//! across target boundaries; its [`ErrorClass`] decides whether a failure is
//! confined to one target or aborts the whole run, and which exit code the
//! command reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ontology::shacl::ShapeViolation;

// =============================================================================
// EXIT CODES
// =============================================================================

pub const EXIT_OK: i32 = 0;
/// Validation or generation failure.
pub const EXIT_FAILURE: i32 = 1;
/// Drift detected (verify only).
pub const EXIT_DRIFT: i32 = 2;
/// Internal or filesystem error.
pub const EXIT_INTERNAL: i32 = 3;

/// Coarse classification used for reporting and exit codes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Query,
    Template,
    Formatter,
    Generation,
    Config,
    Drift,
    Cancelled,
    Io,
    Internal,
}

impl ErrorClass {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::Validation
            | ErrorClass::Query
            | ErrorClass::Template
            | ErrorClass::Formatter
            | ErrorClass::Generation
            | ErrorClass::Config
            | ErrorClass::Cancelled => EXIT_FAILURE,
            ErrorClass::Drift => EXIT_DRIFT,
            ErrorClass::Io | ErrorClass::Internal => EXIT_INTERNAL,
        }
    }

    /// Global errors abort the run before any target starts.
    pub fn is_global(&self) -> bool {
        matches!(self, ErrorClass::Config)
    }
}

// =============================================================================
// STAGE ERRORS
// =============================================================================

/// Stage 1: the specification does not conform to its shapes.
///
/// Always carries the complete violation list, never just the first one.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub violations: Vec<ShapeViolation>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "specification violates {} shape constraint(s)",
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Stage 2: query execution or result reshaping failed.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(
        "query {query} has no top-level ORDER BY clause; results must be totally ordered"
    )]
    Unordered { query: String },

    #[error("query {query} is invalid: {message}")]
    Syntax { query: String, message: String },

    #[error("query {query} failed during evaluation: {message}")]
    Evaluation { query: String, message: String },

    #[error("query {query} is not a SELECT query")]
    NotSelect { query: String },

    #[error("query {query} aborted after exceeding its {bound:?} time bound")]
    Timeout { query: String, bound: Duration },

    #[error("query {query} was cancelled")]
    Cancelled { query: String },

    #[error(
        "row {row_index} of query {query} has no binding for primary key `{key}` (bound: {})",
        available.join(", ")
    )]
    MissingKey {
        query: String,
        key: String,
        row_index: usize,
        available: Vec<String>,
    },
}

/// Stage 3: template parsing or rendering failed.
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error(
        "template {template} references undefined variable `{variable}` (available: {})",
        available.join(", ")
    )]
    UndefinedVariable {
        template: String,
        variable: String,
        available: Vec<String>,
    },

    #[error("template {template} has a syntax error: {message}")]
    Syntax { template: String, message: String },

    #[error("template {template}: filter {} failed: {message}", filter.as_deref().unwrap_or("<unknown>"))]
    Filter {
        template: String,
        filter: Option<String>,
        message: String,
    },

    #[error("template {template} failed to render: {message}")]
    Render { template: String, message: String },
}

/// Stage 4: the external formatter failed.
#[derive(Debug, Clone, Error)]
pub enum FormatterError {
    #[error("formatter `{command}` could not be started: {message}")]
    Spawn { command: String, message: String },

    #[error("formatter `{command}` exited with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("formatter `{command}` killed after exceeding its {bound:?} time bound")]
    Timeout { command: String, bound: Duration },

    #[error("formatter `{command}` was cancelled")]
    Cancelled { command: String },
}

/// Verifier: an artifact no longer matches its receipt.
#[derive(Debug, Clone, Error)]
#[error("artifact {path} drifted: receipt records {expected}, file hashes to {actual}")]
pub struct DriftError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Configuration problems. Always global.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to parse configuration {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration {} is invalid:\n  - {}", path.display(), issues.join("\n  - "))]
    Invalid { path: PathBuf, issues: Vec<String> },

    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error("target `{0}` is disabled")]
    DisabledTarget(String),
}

// =============================================================================
// PIPELINE ERROR
// =============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Formatter(#[from] FormatterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Drift(#[from] DriftError),

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("output {pattern}: {reason}")]
    Output { pattern: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("run cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("workspace is locked by another run ({}, pid {})", path.display(), holder.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    Locked { path: PathBuf, holder: Option<u32> },

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn cancelled(stage: impl Into<String>) -> Self {
        PipelineError::Cancelled {
            stage: stage.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Validation(_) | PipelineError::Parse { .. } => ErrorClass::Validation,
            PipelineError::Query(QueryError::Cancelled { .. }) => ErrorClass::Cancelled,
            PipelineError::Query(_) => ErrorClass::Query,
            PipelineError::Template(_) => ErrorClass::Template,
            PipelineError::Formatter(FormatterError::Cancelled { .. }) => ErrorClass::Cancelled,
            PipelineError::Formatter(_) => ErrorClass::Formatter,
            PipelineError::Config(_) => ErrorClass::Config,
            PipelineError::Drift(_) => ErrorClass::Drift,
            PipelineError::Output { .. } => ErrorClass::Generation,
            PipelineError::Io { .. } | PipelineError::Locked { .. } => ErrorClass::Io,
            PipelineError::Cancelled { .. } => ErrorClass::Cancelled,
            PipelineError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
