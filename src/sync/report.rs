//! Run reports for `sync` and `verify`
//!
//! Every target outcome and every verification result is aggregated here
//! rather than surfaced one at a time. Reports render as human-readable
//! markdown (default) or machine-readable JSON and decide the exit code.
//!
//! ## Report Structure
//! - Header: mode, status, duration
//! - Plan: change set and full-rebuild reason
//! - One line per target with its artifacts, warnings and error
//! - Dry-run diffs

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use super::pipeline::{ArtifactChange, ChangeKind};
use crate::error::{EXIT_DRIFT, EXIT_FAILURE, EXIT_INTERNAL, EXIT_OK, ErrorClass, PipelineError};
use crate::verify::{VerificationResult, VerifyMode};

// ============================================================================
// Formats
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportFormat {
    /// Human-readable markdown (default)
    #[default]
    Markdown,
    /// Machine-readable JSON
    Json,
}

fn tick(ok: bool) -> &'static str {
    if ok { "✅" } else { "❌" }
}

// ============================================================================
// Sync report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetStatus {
    /// Rebuilt (or confirmed byte-identical) and committed.
    Succeeded,
    /// Planned as current; nothing ran.
    Skipped,
    /// Disabled in the configuration.
    Disabled,
    Failed,
    /// Abandoned because the run was cancelled or hit its deadline.
    NotCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&PipelineError> for ErrorReport {
    fn from(err: &PipelineError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub name: String,
    pub status: TargetStatus,
    /// Why the planner scheduled the target, or `current`.
    pub plan: String,
    pub artifacts: Vec<ArtifactChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanSummary {
    pub changed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_rebuild: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Correlates the report with the run's log records.
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub plan: PlanSummary,
    pub targets: Vec<TargetReport>,
    /// Artifacts of targets that left the configuration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<ArtifactChange>,
    pub cancelled: bool,
    pub deadline_expired: bool,
}

impl SyncReport {
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn count(&self, status: TargetStatus) -> usize {
        self.targets.iter().filter(|t| t.status == status).count()
    }

    pub fn not_completed(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.status == TargetStatus::NotCompleted)
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.targets
            .iter()
            .all(|t| !matches!(t.status, TargetStatus::Failed | TargetStatus::NotCompleted))
    }

    pub fn exit_code(&self) -> i32 {
        let mut code = EXIT_OK;
        for target in &self.targets {
            let target_code = match (&target.status, &target.error) {
                (TargetStatus::Failed, Some(error)) => error.class.exit_code(),
                (TargetStatus::Failed, None) | (TargetStatus::NotCompleted, _) => EXIT_FAILURE,
                _ => EXIT_OK,
            };
            code = code.max(target_code);
        }
        code
    }

    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Json => serde_json::to_string_pretty(self)
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize report: {e}\"}}")),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let status = if self.cancelled {
            "cancelled"
        } else if self.is_success() {
            "success"
        } else {
            "failed"
        };

        let _ = writeln!(out, "# ggen Sync Report");
        let _ = writeln!(out, "**Run**: {}", self.run_id);
        let _ = writeln!(
            out,
            "**Started**: {}",
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "**Mode**: {}", if self.dry_run { "dry run" } else { "apply" });
        let _ = writeln!(out, "**Status**: {} {status}", tick(self.is_success()));
        let _ = writeln!(out, "**Duration**: {}ms\n", self.duration_ms);

        let _ = writeln!(out, "## Plan");
        let _ = writeln!(out, "- Changed inputs: {}", self.plan.changed.len());
        for path in &self.plan.changed {
            let _ = writeln!(out, "  - {path}");
        }
        if let Some(reason) = &self.plan.full_rebuild {
            let _ = writeln!(out, "- Full rebuild: {reason}");
        }
        for name in &self.plan.removed_targets {
            let _ = writeln!(out, "- Removed target: {name}");
        }
        out.push('\n');

        let _ = writeln!(out, "## Targets");
        for target in &self.targets {
            let ok = !matches!(target.status, TargetStatus::Failed | TargetStatus::NotCompleted);
            let _ = writeln!(
                out,
                "{} **{}**: {} ({}, {}ms)",
                tick(ok),
                target.name,
                target.status,
                target.plan,
                target.duration_ms
            );
            for change in &target.artifacts {
                let _ = writeln!(out, "  - {} {}", change.kind, change.path);
            }
            for warning in &target.warnings {
                let _ = writeln!(out, "  - ⚠️ {warning}");
            }
            if let Some(error) = &target.error {
                let _ = writeln!(out, "  - {} error: {}", error.class, error.message);
            }
        }
        for change in &self.removed {
            let _ = writeln!(out, "- {} {}", change.kind, change.path);
        }
        out.push('\n');

        let totals = |kind: ChangeKind| {
            self.targets
                .iter()
                .flat_map(|t| &t.artifacts)
                .chain(&self.removed)
                .filter(|c| c.kind == kind)
                .count()
        };
        let _ = writeln!(out, "## Changes");
        let _ = writeln!(out, "- Created: {}", totals(ChangeKind::Created));
        let _ = writeln!(out, "- Updated: {}", totals(ChangeKind::Updated));
        let _ = writeln!(out, "- Unchanged: {}", totals(ChangeKind::Unchanged));
        let _ = writeln!(out, "- Deleted: {}", totals(ChangeKind::Deleted));

        let not_completed = self.not_completed();
        if !not_completed.is_empty() {
            let _ = writeln!(out, "\n## Not Completed");
            if self.deadline_expired {
                let _ = writeln!(out, "Run deadline exceeded.");
            }
            for name in not_completed {
                let _ = writeln!(out, "- {name}");
            }
        }

        if self.dry_run {
            let diffs: Vec<&ArtifactChange> = self
                .targets
                .iter()
                .flat_map(|t| &t.artifacts)
                .filter(|c| c.diff.is_some())
                .collect();
            if !diffs.is_empty() {
                let _ = writeln!(out, "\n## Diff");
                for change in diffs {
                    let _ = writeln!(out, "```diff\n{}```", change.diff.as_deref().unwrap_or_default());
                }
            }
        }
        out
    }
}

// ============================================================================
// Verify report
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub mode: VerifyMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub entries: Vec<VerifyEntry>,
    /// I/O failures that prevented a verdict.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.entries.iter().all(|e| e.result.is_valid())
    }

    /// 3 when any artifact could not be read, 2 when any result is not
    /// `Valid`, else 0.
    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            EXIT_INTERNAL
        } else if self.entries.iter().any(|e| !e.result.is_valid()) {
            EXIT_DRIFT
        } else {
            EXIT_OK
        }
    }

    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Json => serde_json::to_string_pretty(self)
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize report: {e}\"}}")),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# ggen Verify Report");
        let _ = writeln!(out, "**Mode**: {}", self.mode);
        if let Some(target) = &self.target {
            let _ = writeln!(out, "**Target**: {target}");
        }
        let _ = writeln!(
            out,
            "**Status**: {} {}\n",
            tick(self.is_clean()),
            if self.is_clean() { "valid" } else { "problems found" }
        );

        let _ = writeln!(out, "## Artifacts");
        if self.entries.is_empty() {
            let _ = writeln!(out, "No generated artifacts found.");
        }
        for entry in &self.entries {
            let detail = match &entry.result {
                VerificationResult::Valid => "valid".to_string(),
                VerificationResult::Missing => "missing".to_string(),
                VerificationResult::Drifted { expected, actual } => {
                    format!("drifted (expected {expected}, actual {actual})")
                }
                VerificationResult::InvalidReceipt { reason } => {
                    format!("invalid receipt: {reason}")
                }
            };
            let _ = writeln!(out, "{} {}: {detail}", tick(entry.result.is_valid()), entry.output);
        }
        if !self.errors.is_empty() {
            let _ = writeln!(out, "\n## Errors");
            for error in &self.errors {
                let _ = writeln!(out, "- {error}");
            }
        }
        out
    }
}
