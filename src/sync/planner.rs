//! Regeneration planning
//!
//! The planner decides, per target, whether it is `Current` or `Stale`. The
//! decision is deliberately conservative: a target is only skipped when every
//! input hashes exactly as recorded for that target and every artifact it
//! produced still verifies against its receipt.
//!
//! Rules, first match wins:
//! 1. no record: first build
//! 2. `regeneration.mode = "full"`
//! 3. a changed path is a global trigger (config, shapes, templates per policy)
//! 4. an input hash or the input set differs from the target's record
//! 5. a recorded artifact is missing, drifted, or lacks a valid receipt
//! 6. otherwise current

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use super::state::{ChangeSet, DependencyGraph};
use crate::codegen::hash;
use crate::config::{RegenerationMode, TargetConfig, Workspace};
use crate::error::{ConfigError, PipelineError};
use crate::verify::{self, VerificationResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StaleReason {
    FirstBuild,
    FullMode,
    GlobalTrigger { path: String, trigger: String },
    InputChanged { path: String },
    InputSetChanged,
    OutputMissing { path: String },
    OutputDrifted { path: String },
    ReceiptInvalid { path: String, reason: String },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::FirstBuild => f.write_str("first build"),
            StaleReason::FullMode => f.write_str("full regeneration mode"),
            StaleReason::GlobalTrigger { path, trigger } => {
                write!(f, "{trigger} trigger: {path} changed")
            }
            StaleReason::InputChanged { path } => write!(f, "input {path} changed"),
            StaleReason::InputSetChanged => f.write_str("input set changed"),
            StaleReason::OutputMissing { path } => write!(f, "artifact {path} missing"),
            StaleReason::OutputDrifted { path } => write!(f, "artifact {path} drifted"),
            StaleReason::ReceiptInvalid { path, reason } => {
                write!(f, "receipt for {path} invalid: {reason}")
            }
        }
    }
}

/// Lifecycle of a target across runs: `Unknown -> Tracked -> {Stale, Current}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TargetState {
    /// Never built and not scheduled (disabled).
    Unknown,
    /// Recorded in the snapshot but not scheduled (disabled).
    Tracked,
    Stale { reason: StaleReason },
    Current,
}

impl TargetState {
    pub fn is_stale(&self) -> bool {
        matches!(self, TargetState::Stale { .. })
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Unknown => f.write_str("unknown"),
            TargetState::Tracked => f.write_str("tracked"),
            TargetState::Stale { reason } => write!(f, "stale ({reason})"),
            TargetState::Current => f.write_str("current"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetDecision {
    pub name: String,
    pub state: TargetState,
    /// Current input hashes, as they will be recorded after a rebuild.
    pub inputs: BTreeMap<String, String>,
    /// Artifacts recorded for the target by the previous run.
    pub previous_outputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegenerationPlan {
    pub decisions: Vec<TargetDecision>,
    pub change_set: ChangeSet,
    /// Set when a rule forced every target to rebuild.
    pub full_rebuild: Option<StaleReason>,
    /// Recorded targets that no longer exist in the configuration.
    pub removed_targets: Vec<String>,
    /// Hashes of every input of every enabled target plus the config file.
    pub current_hashes: BTreeMap<String, String>,
    /// The plan covers every enabled target.
    pub full_scope: bool,
}

impl RegenerationPlan {
    pub fn stale(&self) -> impl Iterator<Item = &TargetDecision> {
        self.decisions.iter().filter(|d| d.state.is_stale())
    }

    pub fn current(&self) -> impl Iterator<Item = &TargetDecision> {
        self.decisions
            .iter()
            .filter(|d| d.state == TargetState::Current)
    }
}

pub struct RegenerationPlanner<'a> {
    workspace: &'a Workspace,
}

impl<'a> RegenerationPlanner<'a> {
    pub fn new(workspace: &'a Workspace) -> Self {
        Self { workspace }
    }

    /// Input files of a target as `(resolved path, key)`.
    fn input_files(&self, target: &TargetConfig) -> Vec<(std::path::PathBuf, String)> {
        let ws = self.workspace;
        std::iter::once(&target.source)
            .chain(&target.shapes)
            .chain([&target.query, &target.template])
            .map(|p| (ws.resolve(p), ws.key_for(p)))
            .collect()
    }

    /// Current hash of every input, plus the target's virtual config entry.
    /// An unreadable file is left out, which reads as a change.
    pub fn target_inputs(&self, target: &TargetConfig) -> BTreeMap<String, String> {
        let mut inputs = BTreeMap::new();
        for (path, key) in self.input_files(target) {
            match hash::hash_file(&path) {
                Ok(digest) => {
                    inputs.insert(key, digest);
                }
                Err(err) => {
                    tracing::warn!(target_name = %target.name, input = %key, error = %err, "input unreadable");
                }
            }
        }
        inputs.insert(
            self.workspace.target_config_key(target),
            self.workspace.target_config_hash(target),
        );
        inputs
    }

    fn change_key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(self.workspace.root()).unwrap_or(path);
        self.workspace.key_for(relative)
    }

    fn global_trigger(&self, changes: &ChangeSet) -> Option<StaleReason> {
        let ws = self.workspace;
        let triggers = ws.config().regeneration.full_triggers;
        let enabled: Vec<&TargetConfig> = ws.config().enabled_targets().collect();
        let shapes: BTreeSet<String> = enabled
            .iter()
            .flat_map(|t| t.shapes.iter().map(|s| ws.key_for(s)))
            .collect();
        let templates: BTreeSet<String> = enabled.iter().map(|t| ws.key_for(&t.template)).collect();

        for path in changes.paths() {
            let trigger = if triggers.config_change && path == ws.config_key() {
                "config"
            } else if triggers.shape_change && shapes.contains(path) {
                "shape"
            } else if triggers.template_change && templates.contains(path) {
                "template"
            } else {
                continue;
            };
            return Some(StaleReason::GlobalTrigger {
                path: path.to_string(),
                trigger: trigger.to_string(),
            });
        }
        None
    }

    fn check_outputs(&self, outputs: &[String]) -> Result<Option<StaleReason>, PipelineError> {
        for output in outputs {
            let reason = match verify::check_artifact(self.workspace, output)? {
                VerificationResult::Valid => continue,
                VerificationResult::Missing => StaleReason::OutputMissing {
                    path: output.clone(),
                },
                VerificationResult::Drifted { .. } => StaleReason::OutputDrifted {
                    path: output.clone(),
                },
                VerificationResult::InvalidReceipt { reason } => StaleReason::ReceiptInvalid {
                    path: output.clone(),
                    reason,
                },
            };
            return Ok(Some(reason));
        }
        Ok(None)
    }

    /// Plans every enabled target, or only `only` when given. `changed`
    /// replaces the hash comparison with an external change list for the
    /// global-trigger rule; per-target hash comparison always applies.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        only: Option<&str>,
        changed: Option<&[std::path::PathBuf]>,
    ) -> Result<RegenerationPlan, PipelineError> {
        let ws = self.workspace;
        let config = ws.config();

        let scope: Vec<&TargetConfig> = match only {
            Some(name) => {
                let target = ws.target(name)?;
                if !target.enabled {
                    return Err(ConfigError::DisabledTarget(name.to_string()).into());
                }
                vec![target]
            }
            None => config.targets.iter().collect(),
        };

        let mut per_target: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();
        let mut current_hashes = BTreeMap::new();
        current_hashes.insert(ws.config_key().to_string(), ws.config_hash().to_string());
        for target in config.enabled_targets() {
            let inputs = self.target_inputs(target);
            current_hashes.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
            per_target.insert(target.name.as_str(), inputs);
        }

        let change_set = match changed {
            Some(paths) => ChangeSet::from_paths(paths.iter().map(|p| self.change_key(p))),
            None => ChangeSet::compute(graph.hashes(), &current_hashes),
        };

        let full_rebuild = if config.regeneration.mode == RegenerationMode::Full {
            Some(StaleReason::FullMode)
        } else {
            self.global_trigger(&change_set)
        };

        let affected = graph.affected_targets(&change_set);
        let mut decisions = Vec::with_capacity(scope.len());
        for target in scope {
            let record = graph.target(&target.name);
            let previous_outputs = record.map(|r| r.outputs.clone()).unwrap_or_default();

            let Some(inputs) = per_target.remove(target.name.as_str()) else {
                let state = if record.is_some() {
                    TargetState::Tracked
                } else {
                    TargetState::Unknown
                };
                decisions.push(TargetDecision {
                    name: target.name.clone(),
                    state,
                    inputs: BTreeMap::new(),
                    previous_outputs,
                });
                continue;
            };

            let reason = match record {
                None => Some(StaleReason::FirstBuild),
                Some(_) if full_rebuild.is_some() => full_rebuild.clone(),
                Some(record) => {
                    let changed_input = inputs
                        .iter()
                        .find(|(key, digest)| record.inputs.get(*key) != Some(*digest))
                        .map(|(key, _)| key.clone())
                        .or_else(|| affected.get(&target.name).cloned());
                    match changed_input {
                        Some(path) => Some(StaleReason::InputChanged { path }),
                        None if record.inputs.keys().ne(inputs.keys()) => {
                            Some(StaleReason::InputSetChanged)
                        }
                        None => self.check_outputs(&record.outputs)?,
                    }
                }
            };

            let state = match reason {
                Some(reason) => TargetState::Stale { reason },
                None => TargetState::Current,
            };
            tracing::debug!(target_name = %target.name, state = %state, "target planned");
            decisions.push(TargetDecision {
                name: target.name.clone(),
                state,
                inputs,
                previous_outputs,
            });
        }

        let removed_targets = if only.is_none() {
            graph
                .target_names()
                .filter(|name| config.target(name).is_none())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let plan = RegenerationPlan {
            decisions,
            change_set,
            full_rebuild,
            removed_targets,
            current_hashes,
            full_scope: only.is_none(),
        };
        tracing::info!(
            stale = plan.stale().count(),
            current = plan.current().count(),
            changed = plan.change_set.len(),
            full_rebuild = plan.full_rebuild.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            "regeneration planned"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use crate::sync::state::CompletionEvent;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[[targets]]
name = "a"
source = "spec.ttl"
shapes = ["shapes.ttl"]
query = "a.rq"
template = "shared.tera"
output = "out/a.txt"

[[targets]]
name = "b"
source = "spec.ttl"
query = "b.rq"
template = "shared.tera"
output = "out/b.txt"

[[targets]]
name = "c"
source = "spec.ttl"
query = "c.rq"
template = "c.tera"
output = "out/c.txt"
"#;

    fn setup(config: &str) -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        for (file, body) in [
            ("spec.ttl", "spec"),
            ("shapes.ttl", "shapes"),
            ("a.rq", "a"),
            ("b.rq", "b"),
            ("c.rq", "c"),
            ("shared.tera", "shared"),
            ("c.tera", "c"),
        ] {
            fs::write(dir.path().join(file), body).unwrap();
        }
        fs::write(dir.path().join(CONFIG_FILE_NAME), config).unwrap();
        let ws = Workspace::load(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        (dir, ws)
    }

    /// A graph as if every target had been built with no recorded outputs.
    fn built_graph(ws: &Workspace) -> DependencyGraph {
        let planner = RegenerationPlanner::new(ws);
        let mut graph = DependencyGraph::empty(ws.snapshot_path());
        let plan = planner.plan(&graph, None, None).unwrap();
        for decision in &plan.decisions {
            graph.apply(CompletionEvent {
                target: decision.name.clone(),
                inputs: decision.inputs.clone(),
                outputs: Vec::new(),
            });
        }
        graph.set_hashes(plan.current_hashes);
        graph
    }

    fn stale_names(plan: &RegenerationPlan) -> Vec<&str> {
        plan.stale().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn first_run_builds_everything() {
        let (_dir, ws) = setup(CONFIG);
        let graph = DependencyGraph::empty(ws.snapshot_path());
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert_eq!(stale_names(&plan), vec!["a", "b", "c"]);
        assert_matches!(
            &plan.decisions[0].state,
            TargetState::Stale { reason: StaleReason::FirstBuild }
        );
    }

    #[test]
    fn unchanged_inputs_are_current() {
        let (_dir, ws) = setup(CONFIG);
        let graph = built_graph(&ws);
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert!(plan.change_set.is_empty());
        assert!(stale_names(&plan).is_empty());
        assert_eq!(plan.current().count(), 3);
    }

    #[test]
    fn template_change_marks_every_user_of_it() {
        let (dir, ws) = setup(CONFIG);
        let graph = built_graph(&ws);
        fs::write(dir.path().join("shared.tera"), "edited").unwrap();
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert!(plan.full_rebuild.is_none());
        assert_eq!(stale_names(&plan), vec!["a", "b"]);
        assert_matches!(
            &plan.decisions[0].state,
            TargetState::Stale { reason: StaleReason::InputChanged { path } } if path == "shared.tera"
        );
    }

    #[test]
    fn shape_change_is_a_global_trigger_by_default() {
        let (dir, ws) = setup(CONFIG);
        let graph = built_graph(&ws);
        fs::write(dir.path().join("shapes.ttl"), "edited").unwrap();
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert_matches!(
            &plan.full_rebuild,
            Some(StaleReason::GlobalTrigger { trigger, .. }) if trigger == "shape"
        );
        assert_eq!(stale_names(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn shape_change_without_trigger_rebuilds_only_validated_targets() {
        let config = format!(
            "[regeneration]\nfull_triggers = {{ shape_change = false }}\n{CONFIG}"
        );
        let (dir, ws) = setup(&config);
        let graph = built_graph(&ws);
        fs::write(dir.path().join("shapes.ttl"), "edited").unwrap();
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert!(plan.full_rebuild.is_none());
        assert_eq!(stale_names(&plan), vec!["a"]);
    }

    #[test]
    fn external_change_list_drives_triggers() {
        let (dir, ws) = setup(CONFIG);
        let graph = built_graph(&ws);
        let changed = vec![dir.path().join("c.rq")];
        let plan = RegenerationPlanner::new(&ws)
            .plan(&graph, None, Some(&changed))
            .unwrap();
        assert!(plan.change_set.contains("c.rq"));
        assert_eq!(stale_names(&plan), vec!["c"]);
        // Hashes are unchanged, so only the recorded dependency marks it.
        assert_matches!(
            &plan.decisions[2].state,
            TargetState::Stale { reason: StaleReason::InputChanged { path } } if path == "c.rq"
        );
    }

    #[test]
    fn missing_recorded_output_is_stale() {
        let (_dir, ws) = setup(CONFIG);
        let mut graph = built_graph(&ws);
        let record = graph.target("c").unwrap().clone();
        graph.apply(CompletionEvent {
            target: "c".into(),
            inputs: record.inputs,
            outputs: vec!["out/c.txt".into()],
        });
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert_eq!(stale_names(&plan), vec!["c"]);
    }

    #[test]
    fn single_target_scope_and_removed_targets() {
        let (_dir, ws) = setup(CONFIG);
        let mut graph = built_graph(&ws);
        graph.apply(CompletionEvent {
            target: "retired".into(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
        });

        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert_eq!(plan.removed_targets, vec!["retired".to_string()]);

        let plan = RegenerationPlanner::new(&ws).plan(&graph, Some("b"), None).unwrap();
        assert!(!plan.full_scope);
        assert_eq!(plan.decisions.len(), 1);
        assert!(plan.removed_targets.is_empty());

        let err = RegenerationPlanner::new(&ws).plan(&graph, Some("zzz"), None).unwrap_err();
        assert_matches!(err, PipelineError::Config(ConfigError::UnknownTarget(_)));
    }

    #[test]
    fn full_mode_rebuilds_everything() {
        let config = format!("[regeneration]\nmode = \"full\"\n{CONFIG}");
        let (_dir, ws) = setup(&config);
        let graph = built_graph(&ws);
        let plan = RegenerationPlanner::new(&ws).plan(&graph, None, None).unwrap();
        assert_eq!(plan.full_rebuild, Some(StaleReason::FullMode));
        assert_eq!(stale_names(&plan).len(), 3);
    }
}
