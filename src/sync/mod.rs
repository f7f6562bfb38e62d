//! Incremental synchronization of generated artifacts
//!
//! [`SyncEngine::sync`] is the single entry point:
//!
//! 1. take the workspace lock (skipped for dry runs)
//! 2. load the dependency snapshot and plan which targets are stale
//! 3. prune artifacts of targets that left the configuration
//! 4. run stale targets on a bounded worker pool
//! 5. fold completion events into the dependency graph and persist it
//!
//! Workers never touch the graph. Each one sends a [`CompletionEvent`] after
//! its commit succeeds; a single aggregator task owns the graph and applies
//! events as they arrive, so a cancelled or crashed run still records every
//! target that finished.

pub mod output;
pub mod pipeline;
pub mod planner;
pub mod receipt;
pub mod report;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Workspace;
use crate::error::{ErrorClass, PipelineError};
use crate::lock::SyncLock;
use crate::shutdown::RunCancellation;
use pipeline::{ArtifactChange, ChangeKind, PipelineContext, TargetPipeline};
use planner::{RegenerationPlan, RegenerationPlanner, TargetState};
use report::{ErrorReport, PlanSummary, SyncReport, TargetReport, TargetStatus};
use state::{CompletionEvent, DependencyGraph};

pub use pipeline::TargetBuild;
pub use receipt::{Receipt, ReceiptGenerator};
pub use report::{ReportFormat, VerifyReport};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Build and diff in memory; write nothing.
    pub dry_run: bool,
    /// Restrict the run to one enabled target.
    pub target: Option<String>,
    /// Externally supplied change list. Replaces the snapshot hash
    /// comparison when deciding global triggers.
    pub changed_paths: Option<Vec<PathBuf>>,
}

type WorkerOutcome = (usize, Result<Vec<ArtifactChange>, PipelineError>, Vec<String>, u64);

pub struct SyncEngine {
    workspace: Arc<Workspace>,
    cancel: CancellationToken,
}

fn join_error(err: tokio::task::JoinError) -> PipelineError {
    PipelineError::Internal(format!("worker task failed: {err}"))
}

fn pending_report(name: &str, status: TargetStatus, plan: String) -> TargetReport {
    TargetReport {
        name: name.to_string(),
        status,
        plan,
        artifacts: Vec::new(),
        warnings: Vec::new(),
        error: None,
        duration_ms: 0,
    }
}

impl SyncEngine {
    pub fn new(workspace: impl Into<Arc<Workspace>>) -> Self {
        Self {
            workspace: workspace.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` as the parent of every run's cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Loads the snapshot and plans without building anything.
    pub async fn plan(&self, options: &SyncOptions) -> Result<(DependencyGraph, RegenerationPlan), PipelineError> {
        let ws = self.workspace.clone();
        let only = options.target.clone();
        let changed = options.changed_paths.clone();
        tokio::task::spawn_blocking(move || {
            let graph = DependencyGraph::load(ws.snapshot_path())?;
            let plan = RegenerationPlanner::new(&ws).plan(&graph, only.as_deref(), changed.as_deref())?;
            Ok((graph, plan))
        })
        .await
        .map_err(join_error)?
    }

    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport, PipelineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("sync", run_id = %run_id, dry_run = options.dry_run, target = ?options.target);
        self.run(run_id, options).instrument(span).await
    }

    async fn run(&self, run_id: String, options: SyncOptions) -> Result<SyncReport, PipelineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ws = self.workspace.clone();
        let limits = ws.config().limits.clone();

        let _lock = if options.dry_run {
            None
        } else {
            Some(SyncLock::acquire(&ws.state_dir(), limits.lock_timeout.as_duration()).await?)
        };

        let (mut graph, plan) = self.plan(&options).await?;
        let run = RunCancellation::new(&self.cancel, limits.run_deadline.as_duration());
        let ctx = Arc::new(PipelineContext::new(ws.clone(), run.token())?);

        // Targets that left the configuration.
        let mut removed = Vec::new();
        for name in &plan.removed_targets {
            if options.dry_run {
                if let Some(record) = graph.target(name) {
                    removed.extend(
                        record
                            .outputs
                            .iter()
                            .filter(|o| ws.resolve(o).exists())
                            .map(|o| ArtifactChange {
                                path: o.clone(),
                                kind: ChangeKind::Deleted,
                                diff: None,
                            }),
                    );
                }
            } else if let Some(record) = graph.remove_target(name) {
                tracing::info!(target_name = %name, outputs = record.outputs.len(), "pruning removed target");
                removed.extend(pipeline::remove_outputs(&ws, &record.outputs)?);
            }
        }

        let mut reports: Vec<TargetReport> = plan
            .decisions
            .iter()
            .map(|d| match &d.state {
                TargetState::Unknown | TargetState::Tracked => {
                    pending_report(&d.name, TargetStatus::Disabled, d.state.to_string())
                }
                TargetState::Current => pending_report(&d.name, TargetStatus::Skipped, d.state.to_string()),
                TargetState::Stale { reason } => {
                    pending_report(&d.name, TargetStatus::NotCompleted, reason.to_string())
                }
            })
            .collect();

        // Aggregator: sole owner of the graph while workers run.
        let (events, mut inbox) = mpsc::unbounded_channel::<CompletionEvent>();
        let aggregator = tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                graph.apply(event);
            }
            graph
        });

        let workers = Arc::new(Semaphore::new(limits.workers.max(1)));
        let token = run.token();
        let mut join_set: JoinSet<WorkerOutcome> = JoinSet::new();

        for (index, decision) in plan.decisions.iter().enumerate() {
            if !decision.state.is_stale() {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = workers.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                tracing::warn!(target_name = %decision.name, "not started: run cancelled");
                break;
            };
            let target = ws.target(&decision.name)?.clone();
            let ctx = ctx.clone();
            let events = events.clone();
            let previous = decision.previous_outputs.clone();
            let dry_run = options.dry_run;

            join_set.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let name = target.name.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let pipeline = TargetPipeline::new(ctx, target);
                    if dry_run {
                        let build = pipeline.build(None)?;
                        let changes = pipeline.preview(&build, &previous)?;
                        Ok((build, changes))
                    } else {
                        pipeline.run(&previous)
                    }
                })
                .await
                .map_err(join_error)
                .and_then(|r| r);

                let elapsed = started.elapsed().as_millis() as u64;
                match result {
                    Ok((build, changes)) => {
                        if !dry_run {
                            // Receiver lives until every worker is joined.
                            let _ = events.send(CompletionEvent {
                                target: name,
                                outputs: build.outputs(),
                                inputs: build.inputs,
                            });
                        }
                        (index, Ok(changes), build.warnings, elapsed)
                    }
                    Err(err) => (index, Err(err), Vec::new(), elapsed),
                }
            });
        }
        drop(events);

        while let Some(joined) = join_set.join_next().await {
            let (index, result, warnings, elapsed) = joined.map_err(join_error)?;
            let report = &mut reports[index];
            report.duration_ms = elapsed;
            report.warnings = warnings;
            match result {
                Ok(changes) => {
                    report.status = TargetStatus::Succeeded;
                    report.artifacts = changes;
                }
                Err(err) if err.class() == ErrorClass::Cancelled => {
                    tracing::warn!(target_name = %report.name, error = %err, "target abandoned");
                    report.status = TargetStatus::NotCompleted;
                    report.error = Some(ErrorReport::from(&err));
                }
                Err(err) => {
                    tracing::error!(target_name = %report.name, error = %err, "target failed");
                    report.status = TargetStatus::Failed;
                    report.error = Some(ErrorReport::from(&err));
                }
            }
        }

        let mut graph = aggregator.await.map_err(join_error)?;
        let cancelled = run.is_cancelled();
        let deadline_expired = run.deadline_expired();

        if !options.dry_run {
            let complete = reports
                .iter()
                .all(|r| matches!(r.status, TargetStatus::Succeeded | TargetStatus::Skipped | TargetStatus::Disabled));
            if plan.full_scope && complete {
                graph.set_hashes(plan.current_hashes.clone());
            }
            tokio::task::spawn_blocking(move || graph.save())
                .await
                .map_err(join_error)??;
        }

        let report = SyncReport {
            run_id,
            dry_run: options.dry_run,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            plan: PlanSummary {
                changed: plan.change_set.paths().into_iter().map(str::to_string).collect(),
                full_rebuild: plan.full_rebuild.as_ref().map(|r| r.to_string()),
                removed_targets: plan.removed_targets.clone(),
            },
            targets: reports,
            removed,
            cancelled,
            deadline_expired,
        };
        tracing::info!(
            succeeded = report.count(TargetStatus::Succeeded),
            skipped = report.count(TargetStatus::Skipped),
            failed = report.count(TargetStatus::Failed),
            not_completed = report.count(TargetStatus::NotCompleted),
            duration_ms = report.duration_ms,
            "sync finished"
        );
        Ok(report)
    }
}
