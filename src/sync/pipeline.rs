//! Per-target pipeline: Normalize -> Extract -> Emit -> Canonicalize -> Receipt
//!
//! [`TargetPipeline::build`] runs the five stages entirely in memory and
//! returns the artifacts with their receipts. Nothing touches the output tree
//! until [`TargetPipeline::commit`], which stages every artifact and receipt
//! in temporary files, checks for cancellation once, and then renames each
//! artifact followed by its receipt into place. A crash between the two
//! renames leaves an artifact without a matching receipt, which the planner
//! treats as stale.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use super::output::OutputPattern;
use super::receipt::{
    FileHash, InputKind, Receipt, ReceiptGenerator, ReceiptInput, StageInput, StageName,
    StageRecord, receipt_path,
};
use crate::codegen::canonicalize::Canonicalizer;
use crate::codegen::hash;
use crate::config::{TargetConfig, Workspace};
use crate::error::{ConfigError, PipelineError};
use crate::ontology::{self, LoadCache, ShapeSet, Specification};
use crate::sparql::{self, QueryBounds, Queryable, SparqlQuery};
use crate::template::{self, FilterRegistry, Provenance, Renderable, TeraTemplate};

/// Builds slower than this are logged at warn.
const SLOW_TARGET_MS: u64 = 5_000;

/// Shared, read-only state for every target of one run.
pub struct PipelineContext {
    workspace: Arc<Workspace>,
    canonicalizer: Canonicalizer,
    filters: FilterRegistry,
    specs: LoadCache<Specification>,
    shapes: LoadCache<ShapeSet>,
    receipts: ReceiptGenerator,
    cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(workspace: Arc<Workspace>, cancel: CancellationToken) -> Result<Self, PipelineError> {
        let config = workspace.config();
        let filters = FilterRegistry::select(config.emit.filters.as_deref()).map_err(|unknown| {
            ConfigError::Invalid {
                path: workspace.config_path().to_path_buf(),
                issues: unknown
                    .into_iter()
                    .map(|name| format!("emit.filters: unknown filter `{name}`"))
                    .collect(),
            }
        })?;
        Ok(Self {
            canonicalizer: Canonicalizer::new(
                &config.canonicalize,
                config.limits.formatter_timeout.as_duration(),
            ),
            filters,
            specs: LoadCache::new(),
            shapes: LoadCache::new(),
            receipts: ReceiptGenerator::new(),
            cancel,
            workspace,
        })
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    fn check_cancelled(&self, stage: &str) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::cancelled(stage));
        }
        Ok(())
    }
}

/// One artifact rendered in memory, with the receipt that will accompany it.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub output: String,
    pub bytes: Vec<u8>,
    pub receipt: Receipt,
}

#[derive(Debug, Clone)]
pub struct TargetBuild {
    pub target: String,
    pub artifacts: Vec<RenderedArtifact>,
    /// Input key -> hash of the content actually used.
    pub inputs: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl TargetBuild {
    pub fn outputs(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.output.clone()).collect()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Unchanged,
    Deleted,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Unified diff against the file on disk (dry run only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Stages artifacts and receipts in temporary files next to their
/// destinations.
struct StagedWrite {
    output: String,
    artifact: (NamedTempFile, PathBuf),
    receipt: (NamedTempFile, PathBuf),
}

fn stage_file(destination: &Path, bytes: &[u8]) -> Result<NamedTempFile, PipelineError> {
    let dir = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| PipelineError::io(destination, e))?;
    Ok(temp)
}

fn remove_if_present(path: &Path) -> Result<bool, PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PipelineError::io(path, err)),
    }
}

fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, PipelineError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PipelineError::io(path, err)),
    }
}

pub struct TargetPipeline {
    ctx: Arc<PipelineContext>,
    target: TargetConfig,
}

impl TargetPipeline {
    pub fn new(ctx: Arc<PipelineContext>, target: TargetConfig) -> Self {
        Self { ctx, target }
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Runs all stages in memory. `generated_at` overrides the provenance
    /// timestamp; verification passes the one recorded in the receipt.
    pub fn build(&self, generated_at: Option<&str>) -> Result<TargetBuild, PipelineError> {
        let ctx = &self.ctx;
        let ws = ctx.workspace.as_ref();
        let target = &self.target;
        let span = tracing::info_span!("target", name = %target.name);
        let _guard = span.enter();
        let started = Instant::now();

        // Stage 1: normalize
        ctx.check_cancelled("normalize")?;
        let source_key = ws.key_for(&target.source);
        let spec = ctx.specs.get_or_load(vec![source_key.clone()], || {
            Specification::load(&[(ws.resolve(&target.source), source_key.clone())])
        })?;
        let shape_files: Vec<(PathBuf, String)> = target
            .shapes
            .iter()
            .map(|p| (ws.resolve(p), ws.key_for(p)))
            .collect();
        let shapes = ctx.shapes.get_or_load(
            shape_files.iter().map(|(_, key)| key.clone()).collect(),
            || ShapeSet::load(&shape_files),
        )?;
        let validated = ontology::normalize(spec.clone(), &shapes)?;
        let mut warnings: Vec<String> = validated.warnings().iter().map(|w| w.to_string()).collect();
        tracing::debug!(hash = %validated.hash(), "normalize complete");

        // Stage 2: extract
        ctx.check_cancelled("extract")?;
        let query_key = ws.key_for(&target.query);
        let query = SparqlQuery::from_file(&ws.resolve(&target.query), &query_key)?;
        let bounds = QueryBounds::new(ws.query_timeout(target), ctx.cancel.clone());
        let rows = sparql::extract(&validated, &query, &bounds)?;
        let record = sparql::reshape(&rows, target.group.as_ref(), query.id())?;
        let record_hash = hash::hash_canonical_json(&record);
        tracing::debug!(rows = rows.len(), hash = %record_hash, "extract complete");

        // Stage 3: emit
        ctx.check_cancelled("emit")?;
        let template_key = ws.key_for(&target.template);
        let renderer = TeraTemplate::from_file(
            &ws.resolve(&target.template),
            &template_key,
            &ctx.filters,
            ws.emit_mode(target),
        )?;
        let provenance = Provenance {
            source_hash: spec.hash().to_string(),
            template_hash: renderer.hash().to_string(),
            query_hash: query.hash().to_string(),
            generated_at: generated_at
                .map(str::to_string)
                .unwrap_or_else(|| Provenance::timestamp_from(spec.modified())),
        };

        let pattern = OutputPattern::parse(&target.output).map_err(|reason| PipelineError::Output {
            pattern: target.output.clone(),
            reason,
        })?;
        let records = self.expand_outputs(&pattern, &record)?;

        let config_key = ws.target_config_key(target);
        let config_hash = ws.target_config_hash(target);
        let canonical_hash = hash::hash_serialized(&ws.config().canonicalize)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let source_hash = spec
            .sources()
            .iter()
            .find(|s| s.key == source_key)
            .map(|s| s.hash.clone())
            .unwrap_or_else(|| spec.hash().to_string());

        let mut normalize_inputs = vec![StageInput::new(InputKind::Source, &source_key, &source_hash)];
        normalize_inputs.extend(
            shapes
                .sources()
                .iter()
                .map(|s| StageInput::new(InputKind::Shapes, &s.key, &s.hash)),
        );
        normalize_inputs.push(StageInput::new(InputKind::Config, &config_key, &config_hash));
        let normalize_stage = StageRecord {
            name: StageName::Normalize,
            inputs: normalize_inputs,
            output_hash: validated.hash().to_string(),
        };
        let extract_stage = StageRecord {
            name: StageName::Extract,
            inputs: vec![
                StageInput::new(InputKind::Stage, StageName::Normalize.to_string(), validated.hash()),
                StageInput::new(InputKind::Query, &query_key, query.hash()),
            ],
            output_hash: record_hash.clone(),
        };

        let mut artifacts = Vec::with_capacity(records.len());
        for (output, item_record) in records {
            let raw = template::emit(&item_record, &provenance, &renderer)?;
            let emit_hash = hash::hash_bytes(&raw);

            // Stage 4: canonicalize
            ctx.check_cancelled("canonicalize")?;
            let canonical = ctx.canonicalizer.apply(&output, &raw, &ctx.cancel)?;
            warnings.extend(canonical.warnings);
            let output_hash = hash::hash_bytes(&canonical.bytes);

            // Stage 5: receipt
            let stages = vec![
                normalize_stage.clone(),
                extract_stage.clone(),
                StageRecord {
                    name: StageName::Emit,
                    inputs: vec![
                        StageInput::new(InputKind::Stage, StageName::Extract.to_string(), &record_hash),
                        StageInput::new(InputKind::Template, &template_key, renderer.hash()),
                    ],
                    output_hash: emit_hash.clone(),
                },
                StageRecord {
                    name: StageName::Canonicalize,
                    inputs: vec![
                        StageInput::new(InputKind::Stage, StageName::Emit.to_string(), &emit_hash),
                        StageInput::new(
                            InputKind::Config,
                            format!("{}#canonicalize", ws.config_key()),
                            &canonical_hash,
                        ),
                    ],
                    output_hash: output_hash.clone(),
                },
            ];
            let receipt = ctx.receipts.generate(ReceiptInput {
                target: target.name.clone(),
                input: FileHash::new(&source_key, &source_hash),
                generated_at: provenance.generated_at.clone(),
                stages,
                output: FileHash::new(&output, &output_hash),
            })?;
            artifacts.push(RenderedArtifact {
                output,
                bytes: canonical.bytes,
                receipt,
            });
        }

        let mut inputs = BTreeMap::new();
        inputs.insert(source_key, source_hash);
        for source in shapes.sources() {
            inputs.insert(source.key.clone(), source.hash.clone());
        }
        inputs.insert(query_key, query.hash().to_string());
        inputs.insert(template_key, renderer.hash().to_string());
        inputs.insert(config_key, config_hash);

        crate::log_slow_operation!(
            started.elapsed(),
            SLOW_TARGET_MS,
            artifacts = artifacts.len(),
            "target built"
        );
        Ok(TargetBuild {
            target: target.name.clone(),
            artifacts,
            inputs,
            warnings,
        })
    }

    /// One `(output key, record)` per artifact. A templated pattern expands
    /// once per grouped item, which is exposed to the template as `item`.
    fn expand_outputs(&self, pattern: &OutputPattern, record: &Value) -> Result<Vec<(String, Value)>, PipelineError> {
        let target = &self.target;
        let base = match record {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("target".to_string(), Value::String(target.name.clone()));
                map
            }
            _ => Map::new(),
        };
        let output_error = |reason: String| PipelineError::Output {
            pattern: target.output.clone(),
            reason,
        };

        if !pattern.is_templated() {
            return Ok(vec![(pattern.as_str().to_string(), Value::Object(base))]);
        }

        let items = record
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| output_error("placeholders require grouped items".to_string()))?;
        let mut seen = BTreeSet::new();
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Some(fields) = item.as_object() else {
                return Err(output_error(format!("item {index} is not an object")));
            };
            let output = pattern
                .expand(fields, &self.ctx.filters)
                .map_err(|reason| output_error(format!("item {index}: {reason}")))?;
            if !seen.insert(output.clone()) {
                return Err(output_error(format!(
                    "item {index} expands to `{output}`, which another item already produces"
                )));
            }
            let mut item_record = base.clone();
            item_record.insert("item".to_string(), item.clone());
            records.push((output, Value::Object(item_record)));
        }
        Ok(records)
    }

    /// Writes the build. Artifacts whose bytes and receipt already match are
    /// left untouched; recorded outputs the build no longer produces are
    /// deleted along with their receipts.
    pub fn commit(&self, build: &TargetBuild, previous_outputs: &[String]) -> Result<Vec<ArtifactChange>, PipelineError> {
        let ws = self.ctx.workspace.as_ref();
        let receipts_dir = ws.receipts_dir();
        let mut changes = Vec::new();
        let mut staged = Vec::new();

        for artifact in &build.artifacts {
            let artifact_path = ws.resolve(&artifact.output);
            let receipt_file = receipt_path(&receipts_dir, &artifact.output);
            let existing = read_if_present(&artifact_path)?;

            if existing.as_deref() == Some(artifact.bytes.as_slice())
                && Receipt::load(&receipt_file)
                    .is_ok_and(|r| r.verify_proof() && r.structurally_equal(&artifact.receipt))
            {
                changes.push(ArtifactChange {
                    path: artifact.output.clone(),
                    kind: ChangeKind::Unchanged,
                    diff: None,
                });
                continue;
            }

            let kind = if existing.is_some() {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            };
            let receipt_json = artifact.receipt.to_json()?;
            staged.push((
                kind,
                StagedWrite {
                    output: artifact.output.clone(),
                    artifact: (stage_file(&artifact_path, &artifact.bytes)?, artifact_path),
                    receipt: (stage_file(&receipt_file, receipt_json.as_bytes())?, receipt_file),
                },
            ));
        }

        // Last point at which the target can be abandoned cleanly; dropping
        // the staged files removes them.
        self.ctx.check_cancelled("commit")?;

        for (kind, write) in staged {
            let (temp, path) = write.artifact;
            temp.persist(&path).map_err(|e| PipelineError::io(&path, e.error))?;
            let (temp, path) = write.receipt;
            temp.persist(&path).map_err(|e| PipelineError::io(&path, e.error))?;
            tracing::debug!(output = %write.output, kind = %kind, "artifact committed");
            changes.push(ArtifactChange {
                path: write.output,
                kind,
                diff: None,
            });
        }

        let produced: BTreeSet<&str> = build.artifacts.iter().map(|a| a.output.as_str()).collect();
        for stale in previous_outputs {
            if produced.contains(stale.as_str()) {
                continue;
            }
            let removed = remove_if_present(&ws.resolve(stale))?;
            remove_if_present(&receipt_path(&receipts_dir, stale))?;
            if removed {
                tracing::info!(output = %stale, "removed artifact no longer produced");
                changes.push(ArtifactChange {
                    path: stale.clone(),
                    kind: ChangeKind::Deleted,
                    diff: None,
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// What [`commit`](Self::commit) would do, with unified diffs; writes
    /// nothing.
    pub fn preview(&self, build: &TargetBuild, previous_outputs: &[String]) -> Result<Vec<ArtifactChange>, PipelineError> {
        let ws = self.ctx.workspace.as_ref();
        let mut changes = Vec::new();

        for artifact in &build.artifacts {
            let new_text = String::from_utf8_lossy(&artifact.bytes);
            let (kind, diff) = match read_if_present(&ws.resolve(&artifact.output))? {
                Some(existing) if existing == artifact.bytes => (ChangeKind::Unchanged, None),
                Some(existing) => {
                    let old_text = String::from_utf8_lossy(&existing);
                    (
                        ChangeKind::Updated,
                        Some(unified_diff(&artifact.output, &old_text, &new_text)),
                    )
                }
                None => (
                    ChangeKind::Created,
                    Some(unified_diff(&artifact.output, "", &new_text)),
                ),
            };
            changes.push(ArtifactChange {
                path: artifact.output.clone(),
                kind,
                diff,
            });
        }

        let produced: BTreeSet<&str> = build.artifacts.iter().map(|a| a.output.as_str()).collect();
        for stale in previous_outputs {
            if !produced.contains(stale.as_str()) && ws.resolve(stale).exists() {
                changes.push(ArtifactChange {
                    path: stale.clone(),
                    kind: ChangeKind::Deleted,
                    diff: None,
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// Build and commit.
    pub fn run(&self, previous_outputs: &[String]) -> Result<(TargetBuild, Vec<ArtifactChange>), PipelineError> {
        let build = self.build(None)?;
        let changes = self.commit(&build, previous_outputs)?;
        Ok((build, changes))
    }
}

pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Deletes the artifacts and receipts of a target that left the
/// configuration.
pub fn remove_outputs(workspace: &Workspace, outputs: &[String]) -> Result<Vec<ArtifactChange>, PipelineError> {
    let receipts_dir = workspace.receipts_dir();
    let mut changes = Vec::new();
    for output in outputs {
        let removed = remove_if_present(&workspace.resolve(output))?;
        remove_if_present(&receipt_path(&receipts_dir, output))?;
        if removed {
            changes.push(ArtifactChange {
                path: output.clone(),
                kind: ChangeKind::Deleted,
                diff: None,
            });
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const SPEC: &str = r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .

ex:validate a ex:Command ; rdfs:label "validate" .
ex:sync a ex:Command ; rdfs:label "sync" .
"#;

    const QUERY: &str = r#"
PREFIX ex: <http://example.org/cli#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
SELECT ?name WHERE { ?c a ex:Command ; rdfs:label ?name } ORDER BY ?name
"#;

    fn workspace(output: &str, group: bool) -> (TempDir, Arc<Workspace>) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cli.ttl"), SPEC).unwrap();
        fs::write(dir.path().join("commands.rq"), QUERY).unwrap();
        fs::write(
            dir.path().join("cmd.tera"),
            "{% if item %}fn {{ item.name }}() {}{% else %}{% for row in rows %}{{ row.name }}\n{% endfor %}{% endif %}   \n\n",
        )
        .unwrap();
        let group = if group { "group = { key = \"name\" }\n" } else { "" };
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            format!(
                "[[targets]]\nname = \"commands\"\nsource = \"cli.ttl\"\nquery = \"commands.rq\"\ntemplate = \"cmd.tera\"\noutput = \"{output}\"\n{group}"
            ),
        )
        .unwrap();
        let ws = Workspace::load(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        (dir, Arc::new(ws))
    }

    fn pipeline(ws: &Arc<Workspace>) -> TargetPipeline {
        let ctx = Arc::new(PipelineContext::new(ws.clone(), CancellationToken::new()).unwrap());
        TargetPipeline::new(ctx, ws.target("commands").unwrap().clone())
    }

    #[test]
    fn build_produces_canonical_bytes_and_receipts() {
        let (_dir, ws) = workspace("out/commands.txt", false);
        let build = pipeline(&ws).build(None).unwrap();
        assert_eq!(build.artifacts.len(), 1);
        let artifact = &build.artifacts[0];
        assert_eq!(artifact.bytes, b"sync\nvalidate\n");
        assert!(artifact.receipt.verify_proof());
        assert_eq!(artifact.receipt.output.hash, hash::hash_bytes(&artifact.bytes));
        let names: Vec<_> = artifact.receipt.stages.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![StageName::Normalize, StageName::Extract, StageName::Emit, StageName::Canonicalize]
        );
        assert!(build.inputs.contains_key("ggen.toml#targets.commands"));
        assert!(build.inputs.contains_key("cmd.tera"));
    }

    #[test]
    fn templated_outputs_expand_per_item() {
        let (_dir, ws) = workspace("out/{name}.rs", true);
        let build = pipeline(&ws).build(None).unwrap();
        assert_eq!(build.outputs(), vec!["out/sync.rs", "out/validate.rs"]);
        assert_eq!(build.artifacts[1].bytes, b"fn validate() {}\n");
    }

    #[test]
    fn commit_is_idempotent() {
        let (dir, ws) = workspace("out/commands.txt", false);
        let pipeline = pipeline(&ws);
        let (_, first) = pipeline.run(&[]).unwrap();
        assert_eq!(first[0].kind, ChangeKind::Created);
        assert!(dir.path().join(".ggen/receipts/out/commands.txt.receipt.json").is_file());

        let (_, second) = pipeline.run(&["out/commands.txt".to_string()]).unwrap();
        assert_eq!(second[0].kind, ChangeKind::Unchanged);
    }

    #[test]
    fn commit_removes_outputs_no_longer_produced() {
        let (dir, ws) = workspace("out/commands.txt", false);
        let pipeline = pipeline(&ws);
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/old.txt"), "old").unwrap();
        let (_, changes) = pipeline.run(&["out/old.txt".to_string()]).unwrap();
        assert!(changes.iter().any(|c| c.path == "out/old.txt" && c.kind == ChangeKind::Deleted));
        assert!(!dir.path().join("out/old.txt").exists());
    }

    #[test]
    fn cancelled_commit_writes_nothing() {
        let (dir, ws) = workspace("out/commands.txt", false);
        let cancel = CancellationToken::new();
        let ctx = Arc::new(PipelineContext::new(ws.clone(), cancel.clone()).unwrap());
        let pipeline = TargetPipeline::new(ctx, ws.target("commands").unwrap().clone());
        let build = pipeline.build(None).unwrap();
        cancel.cancel();
        let err = pipeline.commit(&build, &[]).unwrap_err();
        assert_matches!(err, PipelineError::Cancelled { .. });
        let leftovers: Vec<_> = walkdir::WalkDir::new(dir.path().join("out"))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn preview_reports_diffs_without_writing() {
        let (dir, ws) = workspace("out/commands.txt", false);
        let pipeline = pipeline(&ws);
        let build = pipeline.build(None).unwrap();
        let changes = pipeline.preview(&build, &[]).unwrap();
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert!(changes[0].diff.as_deref().unwrap().contains("+validate"));
        assert!(!dir.path().join("out/commands.txt").exists());
    }

    #[test]
    fn generated_at_override_is_recorded() {
        let (_dir, ws) = workspace("out/commands.txt", false);
        let build = pipeline(&ws).build(Some("2020-02-02T00:00:00Z")).unwrap();
        assert_eq!(
            build.artifacts[0].receipt.provenance.generated_at,
            "2020-02-02T00:00:00Z"
        );
    }
}
