//! Artifact verification
//!
//! Quick mode proves that each artifact still hashes to what its receipt
//! records and that the receipt's own proof holds. Thorough mode also
//! rebuilds the owning target in memory, reusing the receipt's provenance
//! timestamp, and compares bytes. Verification never writes anything.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::codegen::hash;
use crate::config::Workspace;
use crate::error::{DriftError, PipelineError};
use crate::sync::pipeline::{PipelineContext, TargetPipeline};
use crate::sync::receipt::{self, Receipt, RECEIPT_SUFFIX};
use crate::sync::report::{VerifyEntry, VerifyReport};
use crate::sync::state::DependencyGraph;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    Quick,
    Thorough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Valid,
    Drifted { expected: String, actual: String },
    Missing,
    InvalidReceipt { reason: String },
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid)
    }

    /// The drift as an error value.
    pub fn drift_error(&self, path: &str) -> Option<DriftError> {
        match self {
            VerificationResult::Drifted { expected, actual } => Some(DriftError {
                path: path.to_string(),
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            _ => None,
        }
    }
}

fn invalid(reason: impl Into<String>) -> VerificationResult {
    VerificationResult::InvalidReceipt {
        reason: reason.into(),
    }
}

/// Hash of a file, `None` when it does not exist.
fn hash_if_present(path: &Path) -> Result<Option<String>, PipelineError> {
    match hash::hash_file(path) {
        Ok(digest) => Ok(Some(digest)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PipelineError::io(path, err)),
    }
}

/// Loads and checks the receipt for `output`. The outer error is I/O only.
fn load_receipt(workspace: &Workspace, output: &str) -> Result<Result<Receipt, VerificationResult>, PipelineError> {
    let path = receipt::receipt_path(&workspace.receipts_dir(), output);
    if !path.exists() {
        return Ok(Err(invalid("receipt missing")));
    }
    let receipt = match Receipt::load(&path) {
        Ok(receipt) => receipt,
        Err(PipelineError::Parse { message, .. }) => {
            return Ok(Err(invalid(format!("receipt unreadable: {message}"))));
        }
        Err(other) => return Err(other),
    };
    if !receipt.verify_proof() {
        return Ok(Err(invalid("proof does not match receipt contents")));
    }
    if receipt.output.file != output {
        return Ok(Err(invalid(format!(
            "receipt describes {} instead",
            receipt.output.file
        ))));
    }
    Ok(Ok(receipt))
}

/// Quick verification of one artifact key.
pub fn check_artifact(workspace: &Workspace, output: &str) -> Result<VerificationResult, PipelineError> {
    let actual = hash_if_present(&workspace.resolve(output))?;
    let receipt = match load_receipt(workspace, output)? {
        Ok(receipt) => receipt,
        Err(_) if actual.is_none() => return Ok(VerificationResult::Missing),
        Err(result) => return Ok(result),
    };
    Ok(match actual {
        None => VerificationResult::Missing,
        Some(actual) if actual == receipt.output.hash => VerificationResult::Valid,
        Some(actual) => VerificationResult::Drifted {
            expected: receipt.output.hash,
            actual,
        },
    })
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub target: Option<String>,
    pub mode: VerifyMode,
}

pub struct Verifier {
    workspace: Arc<Workspace>,
}

impl Verifier {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    pub fn verify_artifact(&self, output: &str, mode: VerifyMode) -> Result<VerificationResult, PipelineError> {
        let quick = check_artifact(&self.workspace, output)?;
        if mode == VerifyMode::Quick || !quick.is_valid() {
            return Ok(quick);
        }
        self.rebuild_and_compare(output)
    }

    fn rebuild_and_compare(&self, output: &str) -> Result<VerificationResult, PipelineError> {
        let receipt = match load_receipt(&self.workspace, output)? {
            Ok(receipt) => receipt,
            Err(result) => return Ok(result),
        };
        let Ok(target) = self.workspace.target(&receipt.target) else {
            return Ok(invalid(format!(
                "target `{}` is no longer configured",
                receipt.target
            )));
        };
        let ctx = Arc::new(PipelineContext::new(
            self.workspace.clone(),
            CancellationToken::new(),
        )?);
        let pipeline = TargetPipeline::new(ctx, target.clone());
        let build = match pipeline.build(Some(&receipt.provenance.generated_at)) {
            Ok(build) => build,
            Err(err @ PipelineError::Io { .. }) => return Err(err),
            Err(err) => return Ok(invalid(format!("rebuild failed: {err}"))),
        };
        let Some(artifact) = build.artifacts.iter().find(|a| a.output == output) else {
            return Ok(invalid(format!(
                "target `{}` no longer produces this artifact",
                receipt.target
            )));
        };

        let on_disk = std::fs::read(self.workspace.resolve(output))
            .map_err(|e| PipelineError::io(self.workspace.resolve(output), e))?;
        if on_disk == artifact.bytes {
            Ok(VerificationResult::Valid)
        } else {
            tracing::debug!(output, "rebuild differs from artifact on disk");
            Ok(VerificationResult::Drifted {
                expected: hash::hash_bytes(&artifact.bytes),
                actual: hash::hash_bytes(&on_disk),
            })
        }
    }

    /// Every known artifact key, with the target that owns it when known:
    /// the snapshot's outputs plus every receipt in the receipts directory.
    fn known_artifacts(&self) -> Result<BTreeMap<String, Option<String>>, PipelineError> {
        let graph = DependencyGraph::load(self.workspace.snapshot_path())?;
        let mut artifacts: BTreeMap<String, Option<String>> = graph
            .outputs()
            .map(|o| (o.to_string(), graph.owner_of(o).map(str::to_string)))
            .collect();

        let receipts_dir = self.workspace.receipts_dir();
        if receipts_dir.is_dir() {
            for entry in WalkDir::new(&receipts_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| receipts_dir.clone());
                    PipelineError::io(path, io::Error::other(e.to_string()))
                })?;
                if !entry.file_type().is_file()
                    || !entry.file_name().to_string_lossy().ends_with(RECEIPT_SUFFIX)
                {
                    continue;
                }
                let Some(output) = receipt::output_for_receipt(&receipts_dir, entry.path()) else {
                    continue;
                };
                let owner = Receipt::load(entry.path()).ok().map(|r| r.target);
                let slot = artifacts.entry(output).or_default();
                if slot.is_none() {
                    *slot = owner;
                }
            }
        }
        Ok(artifacts)
    }

    pub fn verify(&self, options: &VerifyOptions) -> Result<VerifyReport, PipelineError> {
        if let Some(name) = &options.target {
            self.workspace.target(name)?;
        }

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for (output, owner) in self.known_artifacts()? {
            if options
                .target
                .as_ref()
                .is_some_and(|name| owner.as_ref() != Some(name))
            {
                continue;
            }
            seen.insert(output.clone());
            match self.verify_artifact(&output, options.mode) {
                Ok(result) => {
                    if let Some(drift) = result.drift_error(&output) {
                        let err = PipelineError::from(drift);
                        tracing::warn!(class = %err.class(), error = %err, "artifact drifted");
                    } else if result.is_valid() {
                        tracing::debug!(output = %output, "artifact valid");
                    } else {
                        tracing::warn!(output = %output, result = ?result, "artifact failed verification");
                    }
                    entries.push(VerifyEntry {
                        output,
                        target: owner,
                        result,
                    });
                }
                Err(err) => {
                    tracing::error!(output = %output, error = %err, "verification error");
                    errors.push(format!("{output}: {err}"));
                }
            }
        }

        tracing::info!(
            artifacts = seen.len(),
            invalid = entries.iter().filter(|e| !e.result.is_valid()).count(),
            mode = %options.mode,
            "verification finished"
        );
        Ok(VerifyReport {
            mode: options.mode,
            target: options.target.clone(),
            entries,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use crate::error::EXIT_DRIFT;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[[targets]]
name = "labels"
source = "spec.ttl"
query = "labels.rq"
template = "labels.tera"
output = "out/labels.txt"
"#;

    fn built_workspace() -> (TempDir, Arc<Workspace>) {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("spec.ttl"),
            "<http://example.org/a> <http://www.w3.org/2000/01/rdf-schema#label> \"alpha\" .\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("labels.rq"),
            "SELECT ?label WHERE { ?s <http://www.w3.org/2000/01/rdf-schema#label> ?label } ORDER BY ?label",
        )
        .unwrap();
        fs::write(
            dir.path().join("labels.tera"),
            "{% for row in rows %}{{ row.label }}\n{% endfor %}",
        )
        .unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), CONFIG).unwrap();
        let ws = Arc::new(Workspace::load(dir.path().join(CONFIG_FILE_NAME)).unwrap());
        let ctx = Arc::new(PipelineContext::new(ws.clone(), CancellationToken::new()).unwrap());
        TargetPipeline::new(ctx, ws.target("labels").unwrap().clone())
            .run(&[])
            .unwrap();
        (dir, ws)
    }

    #[test]
    fn fresh_artifact_is_valid_in_both_modes() {
        let (_dir, ws) = built_workspace();
        let verifier = Verifier::new(ws);
        assert_eq!(
            verifier.verify_artifact("out/labels.txt", VerifyMode::Quick).unwrap(),
            VerificationResult::Valid
        );
        assert_eq!(
            verifier.verify_artifact("out/labels.txt", VerifyMode::Thorough).unwrap(),
            VerificationResult::Valid
        );
    }

    #[test]
    fn edited_artifact_drifts() {
        let (dir, ws) = built_workspace();
        fs::write(dir.path().join("out/labels.txt"), "alpha\nedited\n").unwrap();
        let result = check_artifact(&ws, "out/labels.txt").unwrap();
        assert_matches!(result, VerificationResult::Drifted { ref actual, .. } if *actual == hash::hash_str("alpha\nedited\n"));
        let drift = result.drift_error("out/labels.txt").unwrap();
        assert_eq!(drift.path, "out/labels.txt");
        let err = PipelineError::from(drift);
        assert_eq!(err.class(), crate::error::ErrorClass::Drift);
        assert_eq!(err.class().exit_code(), EXIT_DRIFT);
        assert!(VerificationResult::Missing.drift_error("out/labels.txt").is_none());
    }

    #[test]
    fn missing_artifact_and_receipt() {
        let (dir, ws) = built_workspace();
        fs::remove_file(dir.path().join("out/labels.txt")).unwrap();
        assert_eq!(check_artifact(&ws, "out/labels.txt").unwrap(), VerificationResult::Missing);
        assert_eq!(check_artifact(&ws, "out/never.txt").unwrap(), VerificationResult::Missing);
    }

    #[test]
    fn tampered_receipt_is_invalid() {
        let (dir, ws) = built_workspace();
        let path = dir.path().join(".ggen/receipts/out/labels.txt.receipt.json");
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("labels.tera", "other.tera")).unwrap();
        assert_matches!(
            check_artifact(&ws, "out/labels.txt").unwrap(),
            VerificationResult::InvalidReceipt { .. }
        );

        fs::remove_file(&path).unwrap();
        assert_matches!(
            check_artifact(&ws, "out/labels.txt").unwrap(),
            VerificationResult::InvalidReceipt { reason } if reason == "receipt missing"
        );
    }

    #[test]
    fn thorough_mode_catches_stale_inputs() {
        let (dir, ws) = built_workspace();
        fs::write(
            dir.path().join("labels.tera"),
            "{% for row in rows %}* {{ row.label }}\n{% endfor %}",
        )
        .unwrap();
        let verifier = Verifier::new(ws);
        assert_eq!(
            verifier.verify_artifact("out/labels.txt", VerifyMode::Quick).unwrap(),
            VerificationResult::Valid
        );
        assert_matches!(
            verifier.verify_artifact("out/labels.txt", VerifyMode::Thorough).unwrap(),
            VerificationResult::Drifted { .. }
        );
    }

    #[test]
    fn verify_report_covers_receipted_artifacts() {
        let (dir, ws) = built_workspace();
        let verifier = Verifier::new(ws);
        let report = verifier.verify(&VerifyOptions::default()).unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].target.as_deref(), Some("labels"));
        assert_eq!(report.exit_code(), 0);

        fs::write(dir.path().join("out/labels.txt"), "changed\n").unwrap();
        let report = verifier.verify(&VerifyOptions::default()).unwrap();
        assert_eq!(report.exit_code(), EXIT_DRIFT);
    }
}
