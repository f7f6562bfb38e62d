use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use ggen_sync::config::{CONFIG_FILE_NAME, Workspace};
use ggen_sync::error::{EXIT_FAILURE, PipelineError};
use ggen_sync::shutdown::cancel_on_signal;
use ggen_sync::sync::{ReportFormat, SyncEngine, SyncOptions};
use ggen_sync::verify::{Verifier, VerifyMode, VerifyOptions};
use ggen_sync::{LoggingConfig, init_logging};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "ggen-sync", version, about = "Regenerate artifacts from an RDF specification")]
struct Cli {
    /// Workspace configuration file; its directory is the workspace root.
    #[arg(long, short = 'c', global = true, env = "GGEN_CONFIG", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Regenerate stale targets.
    Sync(SyncArgs),
    /// Check generated artifacts against their receipts.
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Render and diff in memory without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Only consider this target.
    #[arg(long)]
    target: Option<String>,

    /// Paths known to have changed, replacing snapshot comparison for
    /// global triggers.
    #[arg(long, num_args = 1..)]
    changed: Option<Vec<PathBuf>>,

    #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
    format: ReportFormat,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    target: Option<String>,

    /// Also rebuild each target in memory and compare bytes.
    #[arg(long)]
    thorough: bool,

    #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
    format: ReportFormat,
}

fn load_workspace(path: &Path) -> Result<Arc<Workspace>, i32> {
    Workspace::load(path).map(Arc::new).map_err(|err| {
        tracing::error!(error = %err, "configuration rejected");
        eprintln!("error: {err}");
        EXIT_FAILURE
    })
}

fn fail(err: PipelineError) -> i32 {
    tracing::error!(error = %err, class = %err.class(), "run aborted");
    eprintln!("error: {err}");
    err.exit_code()
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let workspace = match load_workspace(&cli.config) {
        Ok(ws) => ws,
        Err(code) => return Ok(code),
    };

    let root = CancellationToken::new();
    let _signals = cancel_on_signal(root.clone());

    let code = match cli.command {
        Command::Sync(args) => {
            let engine = SyncEngine::new(workspace).with_cancellation(root.clone());
            let options = SyncOptions {
                dry_run: args.dry_run,
                target: args.target,
                changed_paths: args.changed,
            };
            match engine.sync(options).await {
                Ok(report) => {
                    println!("{}", report.render(args.format));
                    report.exit_code()
                }
                Err(err) => fail(err),
            }
        }
        Command::Verify(args) => {
            let verifier = Verifier::new(workspace);
            let options = VerifyOptions {
                target: args.target,
                mode: if args.thorough {
                    VerifyMode::Thorough
                } else {
                    VerifyMode::Quick
                },
            };
            let result = tokio::task::spawn_blocking(move || verifier.verify(&options))
                .await
                .context("verification task failed")?;
            match result {
                Ok(report) => {
                    println!("{}", report.render(args.format));
                    report.exit_code()
                }
                Err(err) => fail(err),
            }
        }
    };

    root.cancel();
    Ok(code)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = init_logging(LoggingConfig::from_env().with_verbosity(cli.verbose))?;

    let code = run(cli).await?;
    drop(guard);
    std::process::exit(code);
}
