//! Stage 2: query extraction
//!
//! A [`Queryable`] turns a specification into an ordered [`RowSet`]. The SPARQL
//! implementation refuses queries without a top-level `ORDER BY`, since
//! unordered solutions would make the rendered artifacts nondeterministic.
//!
//! [`extract`] evaluates the query under a watchdog that aborts evaluation
//! through oxigraph's cancellation token when the timeout passes or the run
//! is cancelled. Neither ever truncates a result: the query is aborted and an
//! error is reported instead.

pub mod result_mapper;

use indexmap::IndexMap;
use once_cell::sync::{Lazy, OnceCell};
use oxigraph::model::Term;
use oxigraph::sparql::{
    CancellationToken as EvaluationToken, QueryEvaluationError, QueryResults, SparqlEvaluator,
};
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use result_mapper::{GroupSpec, reshape};

use crate::codegen::hash;
use crate::error::{PipelineError, QueryError};
use crate::ontology::{Specification, ValidatedSpec};

const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

static ORDER_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\border\s+by\b").expect("static regex"));

// =============================================================================
// Typed bindings
// =============================================================================

/// A query binding converted to the value templates see.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue {
    Iri(String),
    BlankNode(String),
    String { value: String, language: Option<String> },
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    /// Any other datatype, kept as its lexical form.
    Typed { value: String, datatype: String },
}

impl BindingValue {
    pub fn from_term(term: &Term) -> Self {
        match term {
            Term::NamedNode(node) => BindingValue::Iri(node.as_str().to_string()),
            Term::BlankNode(node) => BindingValue::BlankNode(node.as_str().to_string()),
            Term::Literal(literal) => {
                let value = literal.value();
                let datatype = literal.datatype().as_str();
                if datatype == RDF_LANG_STRING {
                    return BindingValue::String {
                        value: value.to_string(),
                        language: literal.language().map(str::to_string),
                    };
                }
                let typed = || BindingValue::Typed {
                    value: value.to_string(),
                    datatype: datatype.to_string(),
                };
                match datatype.strip_prefix(XSD) {
                    Some("string") => BindingValue::String {
                        value: value.to_string(),
                        language: None,
                    },
                    Some(
                        "integer" | "int" | "long" | "short" | "byte" | "nonNegativeInteger"
                        | "positiveInteger" | "negativeInteger" | "nonPositiveInteger"
                        | "unsignedInt" | "unsignedLong" | "unsignedShort" | "unsignedByte",
                    ) => value.parse().map(BindingValue::Integer).unwrap_or_else(|_| typed()),
                    Some("decimal" | "double" | "float") => value
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(BindingValue::Decimal)
                        .unwrap_or_else(typed),
                    Some("boolean") => match value {
                        "true" | "1" => BindingValue::Boolean(true),
                        "false" | "0" => BindingValue::Boolean(false),
                        _ => typed(),
                    },
                    _ => typed(),
                }
            }
            #[allow(unreachable_patterns)]
            other => BindingValue::Typed {
                value: other.to_string(),
                datatype: String::new(),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            BindingValue::Iri(v) | BindingValue::BlankNode(v) => Value::String(v.clone()),
            BindingValue::String { value, .. } | BindingValue::Typed { value, .. } => {
                Value::String(value.clone())
            }
            BindingValue::Integer(v) => Value::from(*v),
            BindingValue::Decimal(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            BindingValue::Boolean(v) => Value::Bool(*v),
        }
    }
}

impl BindingValue {
    /// Type-preserving form used to tell bindings apart. [`to_json`](Self::to_json)
    /// is lossy: an IRI and a plain literal with the same text look alike there.
    pub fn identity(&self) -> Value {
        match self {
            BindingValue::Iri(v) => json!(["iri", v]),
            BindingValue::BlankNode(v) => json!(["bnode", v]),
            BindingValue::String { value, language } => json!(["string", value, language]),
            BindingValue::Integer(v) => json!(["integer", v]),
            BindingValue::Decimal(v) => json!(["decimal", v.to_string()]),
            BindingValue::Boolean(v) => json!(["boolean", v]),
            BindingValue::Typed { value, datatype } => json!(["typed", value, datatype]),
        }
    }
}

impl Serialize for BindingValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One solution. Unbound variables are absent.
pub type Row = IndexMap<String, BindingValue>;

/// Ordered query solutions plus the projection they were produced under.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub variables: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// =============================================================================
// Queryable
// =============================================================================

pub trait Queryable: Send + Sync {
    /// Identity shown in errors, usually the query file key.
    fn id(&self) -> &str;

    fn hash(&self) -> &str;

    /// Evaluates against `spec`, stopping early once `abort` is cancelled.
    fn run(&self, spec: &Specification, abort: &EvaluationToken) -> Result<RowSet, QueryError>;
}

#[derive(Debug, Clone)]
pub struct SparqlQuery {
    id: String,
    text: String,
    hash: String,
}

impl SparqlQuery {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Result<Self, QueryError> {
        let id = id.into();
        let text = text.into();
        if !has_top_level_order_by(&text) {
            return Err(QueryError::Unordered { query: id });
        }
        Ok(Self {
            hash: hash::hash_str(&text),
            id,
            text,
        })
    }

    pub fn from_file(path: &Path, key: &str) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(Self::new(key, text)?)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn evaluation_error(&self, err: QueryEvaluationError) -> QueryError {
        match err {
            QueryEvaluationError::Cancelled => QueryError::Cancelled {
                query: self.id.clone(),
            },
            other => QueryError::Evaluation {
                query: self.id.clone(),
                message: other.to_string(),
            },
        }
    }
}

impl Queryable for SparqlQuery {
    fn id(&self) -> &str {
        &self.id
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn run(&self, spec: &Specification, abort: &EvaluationToken) -> Result<RowSet, QueryError> {
        let results = SparqlEvaluator::new()
            .with_cancellation_token(abort.clone())
            .parse_query(self.text.as_str())
            .map_err(|e| QueryError::Syntax {
                query: self.id.clone(),
                message: e.to_string(),
            })?
            .on_store(spec.store())
            .execute()
            .map_err(|e| self.evaluation_error(e))?;
        let QueryResults::Solutions(solutions) = results else {
            return Err(QueryError::NotSelect {
                query: self.id.clone(),
            });
        };

        let variables: Vec<String> = solutions
            .variables()
            .iter()
            .map(|v| v.as_str().to_string())
            .collect();
        let mut rows = Vec::new();
        for solution in solutions {
            let solution = solution.map_err(|e| self.evaluation_error(e))?;
            let mut row = Row::with_capacity(variables.len());
            for variable in &variables {
                if let Some(term) = solution.get(variable.as_str()) {
                    row.insert(variable.clone(), BindingValue::from_term(term));
                }
            }
            rows.push(row);
        }
        Ok(RowSet { variables, rows })
    }
}

/// Blanks out comments, string literals and IRIs, then looks for `ORDER BY`
/// after the final closing brace, where top-level solution modifiers live.
fn has_top_level_order_by(text: &str) -> bool {
    let stripped = strip_lexical_noise(text);
    let tail = match stripped.rfind('}') {
        Some(pos) => &stripped[pos + 1..],
        None => stripped.as_str(),
    };
    ORDER_BY.is_match(tail)
}

fn strip_lexical_noise(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' | '\'' => {
                let long = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                let delimiter_len = if long { 3 } else { 1 };
                i += delimiter_len;
                while i < chars.len() {
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == c
                        && (!long || (i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c))
                    {
                        i += delimiter_len;
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
                continue;
            }
            '<' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == '>' || ch.is_whitespace());
                if let Some(offset) = close {
                    if chars[i + 1 + offset] == '>' {
                        i += offset + 2;
                        out.push(' ');
                        continue;
                    }
                }
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

// =============================================================================
// Extraction
// =============================================================================

#[derive(Debug, Clone)]
pub struct QueryBounds {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl QueryBounds {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Timeout,
    Cancelled,
}

/// Aborts `token` once `bounds` are exceeded, until `done` disconnects.
fn watch(
    bounds: &QueryBounds,
    token: EvaluationToken,
    done: mpsc::Receiver<()>,
    reason: Arc<OnceCell<Abort>>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let cancel = bounds.cancel.clone();
    let timeout = bounds.timeout;
    thread::Builder::new()
        .name("ggen-query-watchdog".to_string())
        .spawn(move || {
            let started = Instant::now();
            loop {
                match done.recv_timeout(POLL_INTERVAL) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
                let abort = if cancel.is_cancelled() {
                    Abort::Cancelled
                } else if started.elapsed() >= timeout {
                    Abort::Timeout
                } else {
                    continue;
                };
                let _ = reason.set(abort);
                token.cancel();
                return;
            }
        })
}

/// Runs `query` on the calling thread, bounded by `bounds`.
pub fn extract(
    validated: &ValidatedSpec,
    query: &dyn Queryable,
    bounds: &QueryBounds,
) -> Result<RowSet, QueryError> {
    let query_id = query.id().to_string();
    if bounds.cancel.is_cancelled() {
        return Err(QueryError::Cancelled { query: query_id });
    }

    let token = EvaluationToken::new();
    let reason = Arc::new(OnceCell::new());
    let (done, done_rx) = mpsc::channel();
    let watchdog = watch(bounds, token.clone(), done_rx, reason.clone()).map_err(|e| {
        QueryError::Evaluation {
            query: query_id.clone(),
            message: format!("failed to start query watchdog: {e}"),
        }
    })?;

    let started = Instant::now();
    let result = query.run(validated.spec(), &token);
    drop(done);
    let _ = watchdog.join();

    match (result, reason.get()) {
        (_, Some(Abort::Timeout)) => {
            tracing::warn!(query = %query_id, bound = ?bounds.timeout, "query timed out");
            Err(QueryError::Timeout {
                query: query_id,
                bound: bounds.timeout,
            })
        }
        (_, Some(Abort::Cancelled)) => Err(QueryError::Cancelled { query: query_id }),
        (Ok(rows), None) => {
            tracing::debug!(
                query = %query_id,
                rows = rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query executed"
            );
            Ok(rows)
        }
        (Err(err), None) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{ShapeSet, normalize};
    use assert_matches::assert_matches;

    const SPEC: &str = r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .
ex:validate a ex:Command ; rdfs:label "validate" ; ex:position 1 ; ex:hidden false .
ex:sync a ex:Command ; rdfs:label "sync"@en ; ex:position 2 ; ex:weight 0.5 .
"#;

    fn validated() -> ValidatedSpec {
        let spec = Arc::new(Specification::from_turtle("spec.ttl", SPEC).unwrap());
        normalize(spec, &ShapeSet::empty()).unwrap()
    }

    fn bounds() -> QueryBounds {
        QueryBounds::new(Duration::from_secs(10), CancellationToken::new())
    }

    #[test]
    fn requires_top_level_order_by() {
        let unordered = "SELECT ?s WHERE { ?s ?p ?o }";
        assert_matches!(SparqlQuery::new("q.rq", unordered), Err(QueryError::Unordered { .. }));

        let commented = "SELECT ?s WHERE { ?s ?p ?o } # ORDER BY ?s";
        assert_matches!(SparqlQuery::new("q.rq", commented), Err(QueryError::Unordered { .. }));

        let nested = "SELECT ?s WHERE { { SELECT ?s WHERE { ?s ?p ?o } ORDER BY ?s } }";
        assert_matches!(SparqlQuery::new("q.rq", nested), Err(QueryError::Unordered { .. }));

        let quoted = "SELECT ?s WHERE { ?s ?p \"} ORDER BY\" }";
        assert_matches!(SparqlQuery::new("q.rq", quoted), Err(QueryError::Unordered { .. }));

        let ordered = "PREFIX ex: <http://example.org/cli#order>\nSELECT ?s WHERE { ?s ?p ?o }\norder by ?s";
        assert!(SparqlQuery::new("q.rq", ordered).is_ok());
    }

    #[test]
    fn rows_are_typed_and_ordered() {
        let query = SparqlQuery::new(
            "commands.rq",
            "PREFIX ex: <http://example.org/cli#>
             PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
             SELECT ?cmd ?label ?position ?hidden ?weight WHERE {
                ?cmd a ex:Command ; rdfs:label ?label ; ex:position ?position .
                OPTIONAL { ?cmd ex:hidden ?hidden }
                OPTIONAL { ?cmd ex:weight ?weight }
             } ORDER BY ?position",
        )
        .unwrap();
        let rows = extract(&validated(), &query, &bounds()).unwrap();
        assert_eq!(rows.variables, vec!["cmd", "label", "position", "hidden", "weight"]);
        assert_eq!(rows.len(), 2);

        let first = &rows.rows[0];
        assert_eq!(first["cmd"], BindingValue::Iri("http://example.org/cli#validate".into()));
        assert_eq!(first["position"], BindingValue::Integer(1));
        assert_eq!(first["hidden"], BindingValue::Boolean(false));
        assert!(!first.contains_key("weight"));

        let second = &rows.rows[1];
        assert_eq!(
            second["label"],
            BindingValue::String {
                value: "sync".into(),
                language: Some("en".into())
            }
        );
        assert_eq!(second["weight"], BindingValue::Decimal(0.5));
    }

    #[test]
    fn syntax_errors_name_the_query() {
        let query = SparqlQuery::new("broken.rq", "SELECT ?s WHERE { ?s ?p } ORDER BY ?s").unwrap();
        let err = extract(&validated(), &query, &bounds()).unwrap_err();
        assert!(err.to_string().contains("broken.rq"));
    }

    /// Spins until aborted, recording that the abort reached it.
    #[derive(Default)]
    struct SlowQuery {
        aborted: std::sync::atomic::AtomicBool,
    }

    impl Queryable for SlowQuery {
        fn id(&self) -> &str {
            "slow.rq"
        }

        fn hash(&self) -> &str {
            "0"
        }

        fn run(&self, _spec: &Specification, abort: &EvaluationToken) -> Result<RowSet, QueryError> {
            let started = Instant::now();
            while started.elapsed() < Duration::from_secs(10) {
                if abort.is_cancelled() {
                    self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Err(QueryError::Cancelled { query: "slow.rq".into() });
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(RowSet::default())
        }
    }

    #[test]
    fn timeout_aborts_evaluation_instead_of_truncating() {
        let bounds = QueryBounds::new(Duration::from_millis(50), CancellationToken::new());
        let query = SlowQuery::default();
        let started = Instant::now();
        let err = extract(&validated(), &query, &bounds).unwrap_err();
        assert_matches!(err, QueryError::Timeout { bound, .. } if bound == Duration::from_millis(50));
        assert!(query.aborted.load(std::sync::atomic::Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_cancellation_aborts_evaluation() {
        let token = CancellationToken::new();
        let bounds = QueryBounds::new(Duration::from_secs(30), token.clone());
        let query = SlowQuery::default();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let err = extract(&validated(), &query, &bounds).unwrap_err();
        canceller.join().unwrap();
        assert_matches!(err, QueryError::Cancelled { .. });
        assert!(query.aborted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn already_cancelled_run_skips_the_query() {
        let token = CancellationToken::new();
        token.cancel();
        let bounds = QueryBounds::new(Duration::from_secs(10), token);
        let query = SlowQuery::default();
        let err = extract(&validated(), &query, &bounds).unwrap_err();
        assert_matches!(err, QueryError::Cancelled { .. });
        assert!(!query.aborted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn aborted_evaluation_reports_cancelled() {
        let query = SparqlQuery::new("all.rq", "SELECT ?s ?p ?o WHERE { ?s ?p ?o } ORDER BY ?s").unwrap();
        let token = EvaluationToken::new();
        token.cancel();
        let err = query.run(validated().spec(), &token).unwrap_err();
        assert_matches!(err, QueryError::Cancelled { .. });
    }

    #[test]
    fn binding_json_shapes() {
        assert_eq!(BindingValue::Integer(3).to_json(), serde_json::json!(3));
        assert_eq!(BindingValue::Boolean(true).to_json(), serde_json::json!(true));
        assert_eq!(
            BindingValue::Typed {
                value: "2024-01-01".into(),
                datatype: format!("{XSD}date")
            }
            .to_json(),
            serde_json::json!("2024-01-01")
        );
    }
}
