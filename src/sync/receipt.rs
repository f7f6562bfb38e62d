//! Cryptographic receipts for generated artifacts
//!
//! A receipt binds one artifact to the exact hashes of everything that
//! produced it: the source graph, shapes, query, template and the target's
//! configuration, plus the output hash of every stage. The `proof` is the
//! SHA-256 of the canonical JSON of the receipt without `proof` and
//! `metadata`, so it is a pure function of the recorded contents.
//!
//! ## Usage
//! ```ignore
//! let receipt = generator.generate(input)?;
//! assert!(receipt.verify_proof());
//! receipt.save(&receipt_path(&receipts_dir, "src/commands/validate.rs"))?;
//! ```

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::codegen::hash::{self, HASH_ALGORITHM};
use crate::error::PipelineError;

pub const RECEIPT_VERSION: &str = "1.0.0";
pub const RECEIPT_SUFFIX: &str = ".receipt.json";

// ============================================================================
// Receipt Data Structures
// ============================================================================

/// A file reference with its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub file: String,
    pub hash: String,
}

impl FileHash {
    pub fn new(file: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            hash: hash.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageName {
    Normalize,
    Extract,
    Emit,
    Canonicalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputKind {
    Source,
    Shapes,
    Query,
    Template,
    Config,
    /// Output of the preceding stage.
    Stage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInput {
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub file: String,
    pub hash: String,
}

impl StageInput {
    pub fn new(kind: InputKind, file: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.into(),
            hash: hash.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: StageName,
    pub inputs: Vec<StageInput>,
    pub output_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub algorithm: String,
    pub value: String,
}

/// Emission metadata needed to reproduce the artifact byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptProvenance {
    pub generated_at: String,
}

/// Unhashed, machine-specific details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMetadata {
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ReceiptMetadata {
    pub fn current() -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok()
                .filter(|u| !u.is_empty()),
        }
    }
}

/// Complete receipt for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Schema version
    pub version: String,

    /// Target that produced the artifact
    pub target: String,

    /// Issue time, monotonic within a process
    pub timestamp: String,

    /// Primary source graph
    pub input: FileHash,

    pub provenance: ReceiptProvenance,

    /// Normalize, extract, emit, canonicalize, in order
    pub stages: Vec<StageRecord>,

    /// The artifact itself
    pub output: FileHash,

    pub proof: Proof,

    #[serde(default)]
    pub metadata: ReceiptMetadata,
}

impl Receipt {
    /// Recomputes the proof from the hashed portion.
    pub fn compute_proof(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("proof");
            map.remove("metadata");
        }
        Ok(hash::hash_canonical_json(&value))
    }

    pub fn verify_proof(&self) -> bool {
        self.proof.algorithm == HASH_ALGORITHM
            && self
                .compute_proof()
                .is_ok_and(|proof| proof == self.proof.value)
    }

    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Equal in everything but issue time (and therefore proof) and
    /// machine metadata.
    pub fn structurally_equal(&self, other: &Receipt) -> bool {
        self.version == other.version
            && self.target == other.target
            && self.input == other.input
            && self.provenance == other.provenance
            && self.stages == other.stages
            && self.output == other.output
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| PipelineError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self)
            .map(|mut text| {
                text.push('\n');
                text
            })
            .map_err(|e| PipelineError::Internal(format!("failed to serialize receipt: {e}")))
    }
}

/// Central receipt location for an artifact key.
pub fn receipt_path(receipts_dir: &Path, output: &str) -> PathBuf {
    receipts_dir.join(format!("{output}{RECEIPT_SUFFIX}"))
}

/// Inverse of [`receipt_path`] for a path under `receipts_dir`.
pub fn output_for_receipt(receipts_dir: &Path, receipt: &Path) -> Option<String> {
    let relative = receipt.strip_prefix(receipts_dir).ok()?;
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    key.strip_suffix(RECEIPT_SUFFIX).map(str::to_string)
}

// ============================================================================
// Receipt Generator
// ============================================================================

static LAST_ISSUED: Lazy<Mutex<Option<DateTime<Utc>>>> = Lazy::new(|| Mutex::new(None));

/// Wall-clock time, nudged forward so that no two receipts issued by this
/// process share or reverse a timestamp.
fn monotonic_now() -> DateTime<Utc> {
    let mut last = LAST_ISSUED.lock();
    let mut now = Utc::now();
    if let Some(previous) = *last {
        if now <= previous {
            now = previous + ChronoDuration::microseconds(1);
        }
    }
    *last = Some(now);
    now
}

/// Everything a receipt records, gathered by the pipeline.
#[derive(Debug, Clone)]
pub struct ReceiptInput {
    pub target: String,
    pub input: FileHash,
    pub generated_at: String,
    pub stages: Vec<StageRecord>,
    pub output: FileHash,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptGenerator {
    metadata: ReceiptMetadata,
}

impl ReceiptGenerator {
    pub fn new() -> Self {
        Self {
            metadata: ReceiptMetadata::current(),
        }
    }

    pub fn generate(&self, input: ReceiptInput) -> Result<Receipt, PipelineError> {
        let mut receipt = Receipt {
            version: RECEIPT_VERSION.to_string(),
            target: input.target,
            timestamp: monotonic_now().to_rfc3339_opts(SecondsFormat::Micros, true),
            input: input.input,
            provenance: ReceiptProvenance {
                generated_at: input.generated_at,
            },
            stages: input.stages,
            output: input.output,
            proof: Proof {
                algorithm: HASH_ALGORITHM.to_string(),
                value: String::new(),
            },
            metadata: self.metadata.clone(),
        };
        receipt.proof.value = receipt
            .compute_proof()
            .map_err(|e| PipelineError::Internal(format!("failed to hash receipt: {e}")))?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(output_hash: &str) -> ReceiptInput {
        let stage = |name, inputs: Vec<StageInput>, out: &str| StageRecord {
            name,
            inputs,
            output_hash: out.to_string(),
        };
        ReceiptInput {
            target: "commands".into(),
            input: FileHash::new("ontology/cli.ttl", "a".repeat(64)),
            generated_at: "2024-01-01T00:00:00Z".into(),
            stages: vec![
                stage(
                    StageName::Normalize,
                    vec![
                        StageInput::new(InputKind::Source, "ontology/cli.ttl", "a".repeat(64)),
                        StageInput::new(InputKind::Shapes, "ontology/shapes.ttl", "b".repeat(64)),
                    ],
                    "n",
                ),
                stage(
                    StageName::Extract,
                    vec![
                        StageInput::new(InputKind::Stage, "normalize", "n"),
                        StageInput::new(InputKind::Query, "queries/commands.rq", "c".repeat(64)),
                    ],
                    "x",
                ),
                stage(StageName::Emit, vec![StageInput::new(InputKind::Stage, "extract", "x")], "e"),
                stage(
                    StageName::Canonicalize,
                    vec![StageInput::new(InputKind::Stage, "emit", "e")],
                    output_hash,
                ),
            ],
            output: FileHash::new("src/commands.rs", output_hash),
        }
    }

    #[test]
    fn generated_receipt_verifies() {
        let receipt = ReceiptGenerator::new().generate(input("f")).unwrap();
        assert_eq!(receipt.version, RECEIPT_VERSION);
        assert_eq!(receipt.proof.algorithm, "sha256");
        assert_eq!(receipt.proof.value.len(), 64);
        assert!(receipt.verify_proof());
        assert_eq!(receipt.stage(StageName::Canonicalize).unwrap().output_hash, "f");
    }

    #[test]
    fn tampering_invalidates_proof() {
        let mut receipt = ReceiptGenerator::new().generate(input("f")).unwrap();
        receipt.output.hash = "0".repeat(64);
        assert!(!receipt.verify_proof());
    }

    #[test]
    fn metadata_is_not_hashed() {
        let mut receipt = ReceiptGenerator::new().generate(input("f")).unwrap();
        receipt.metadata.hostname = Some("elsewhere".into());
        assert!(receipt.verify_proof());
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let generator = ReceiptGenerator::new();
        let a = generator.generate(input("f")).unwrap();
        let b = generator.generate(input("f")).unwrap();
        let parse = |t: &str| DateTime::parse_from_rfc3339(t).unwrap();
        assert!(parse(&b.timestamp) > parse(&a.timestamp));
        assert!(a.structurally_equal(&b));
        assert_ne!(a.proof, b.proof);
    }

    #[test]
    fn json_round_trip_keeps_field_names() {
        let receipt = ReceiptGenerator::new().generate(input("f")).unwrap();
        let json = receipt.to_json().unwrap();
        assert!(json.contains("\"type\": \"shapes\""));
        assert!(json.contains("\"output_hash\""));
        let parsed: Receipt = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, receipt);
        assert!(parsed.verify_proof());
    }

    #[test]
    fn receipt_paths_map_back_to_outputs() {
        let dir = Path::new("/ws/.ggen/receipts");
        let path = receipt_path(dir, "src/commands/validate.rs");
        assert_eq!(path, dir.join("src/commands/validate.rs.receipt.json"));
        assert_eq!(
            output_for_receipt(dir, &path).as_deref(),
            Some("src/commands/validate.rs")
        );
        assert_eq!(output_for_receipt(dir, Path::new("/elsewhere/x.receipt.json")), None);
    }

    proptest! {
        #[test]
        fn proof_is_a_function_of_contents(hash in "[0-9a-f]{64}") {
            let generator = ReceiptGenerator::new();
            let a = generator.generate(input(&hash)).unwrap();
            let mut b = a.clone();
            b.metadata = ReceiptMetadata::default();
            prop_assert_eq!(a.compute_proof().unwrap(), b.compute_proof().unwrap());
            prop_assert!(b.verify_proof());
        }
    }
}
