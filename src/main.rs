use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sluice_core::config::AppConfig;
use sluice_core::pipeline::PipelineDefinition;
use sluice_core::types::{RunId, RunRecord, RunStatus};
use sluice_engine::cron::read_seed;
use sluice_engine::{ApprovalOutcome, CancelOutcome, Engine, GateTimeoutSweeper, PipelineScheduler};
use sluice_store::SqliteStore;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Data-integration pipeline engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sluice.toml")]
    config: PathBuf,

    /// Run adapters without side effects on external systems
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file to completion or its first paused gate
    Run {
        /// Pipeline definition (.json or .toml)
        pipeline: PathBuf,
        /// JSON file holding the seed batch
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Resume a paused or interrupted run
    Resume { run_id: String },
    /// Approve a paused gate and resume its run
    Approve { run_id: String, step: String },
    /// Cancel a run
    Cancel { run_id: String },
    /// List runs, most recent first
    Runs {
        /// Only runs in this status (e.g. paused, failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the dead letters of a run
    DeadLetters { run_id: String },
    /// Check a pipeline file and print its execution order
    Validate { pipeline: PathBuf },
    /// List registered adapters
    Adapters,
    /// Start the HTTP gateway with the gate timeout sweep and schedules
    Serve,
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    info!(path = %path.display(), "No config file, using defaults");
    Ok(AppConfig::default())
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Arc<Engine>> {
    let store = SqliteStore::open(&config.store.db_path())?;
    let engine = Engine::builder(Arc::new(store)).config(config.clone()).build();
    for path in &config.engine.pipelines {
        if let Err(e) = engine.load_pipeline(Path::new(path)) {
            warn!(path = %path, error = %e, "Skipping pipeline file");
        }
    }
    Ok(engine)
}

fn parse_status(s: &str) -> anyhow::Result<RunStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
        .map_err(|_| anyhow::anyhow!("unknown run status: {s}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a run summary; failed outcomes become a non-zero exit.
fn report(run: &RunRecord) -> anyhow::Result<()> {
    println!(
        "run {}  pipeline={}  status={}  ok={}  failed={}",
        run.id, run.pipeline_code, run.status, run.stats.success_count, run.stats.error_count
    );
    if let Some(failure) = &run.error {
        println!(
            "  error at {}: {}",
            failure.step_key.as_deref().unwrap_or("pipeline"),
            failure.message
        );
    }
    match run.status {
        RunStatus::Failed | RunStatus::Timeout => anyhow::bail!("run {} ended {}", run.id, run.status),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Validation needs no store
    if let Commands::Validate { pipeline } = &cli.command {
        let def = PipelineDefinition::load(pipeline)?;
        def.validate()?;
        let order: Vec<&str> = def
            .execution_order()?
            .into_iter()
            .map(|i| def.steps[i].key.as_str())
            .collect();
        println!("{}: {} steps, {} edges", def.code, def.steps.len(), def.edges.len());
        println!("order: {}", order.join(" -> "));
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    config.engine.dry_run |= cli.dry_run;
    let engine = build_engine(&config)?;

    match cli.command {
        Commands::Validate { .. } => {}
        Commands::Run { pipeline, seed } => {
            let code = engine.load_pipeline(&pipeline)?;
            let seed = match seed {
                Some(path) => read_seed(&path)?,
                None => vec![],
            };
            let run = engine.start_run(&code, seed).await?;
            report(&run)?;
        }
        Commands::Resume { run_id } => {
            let run = engine.resume(&RunId::from_string(&run_id)).await?;
            report(&run)?;
        }
        Commands::Approve { run_id, step } => {
            match engine.approve_gate(&RunId::from_string(&run_id), &step).await? {
                ApprovalOutcome::Resumed(run) => report(&run)?,
                ApprovalOutcome::AlreadyApproved => println!("gate {step} was already approved"),
            }
        }
        Commands::Cancel { run_id } => match engine.cancel(&RunId::from_string(&run_id)).await? {
            CancelOutcome::Cancelled => println!("run {run_id} cancelled"),
            CancelOutcome::Requested => println!("cancellation of run {run_id} requested"),
        },
        Commands::Runs { status } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            for run in engine.list_runs(status).await? {
                println!(
                    "{}  {:<10} {:<20} ok={} failed={} started={}",
                    run.id,
                    run.status,
                    run.pipeline_code,
                    run.stats.success_count,
                    run.stats.error_count,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::DeadLetters { run_id } => {
            let letters = engine.dead_letters(&RunId::from_string(&run_id)).await?;
            print_json(&letters)?;
        }
        Commands::Adapters => {
            for adapter in engine.adapters() {
                println!("{:<10} {:<16} {}", adapter.kind, adapter.code, adapter.description);
            }
        }
        Commands::Serve => {
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down...");
                cancel_clone.cancel();
            });

            let sweeper = GateTimeoutSweeper::new(
                engine.clone(),
                Duration::from_secs(config.gate.sweep_interval_secs),
                cancel.clone(),
            );
            tokio::spawn(async move {
                sweeper.run().await;
            });

            let scheduler = PipelineScheduler::new(&config.schedules, engine.clone(), cancel.clone());
            tokio::spawn(async move {
                scheduler.run().await;
            });

            let server = sluice_gateway::GatewayServer::new(config.gateway.clone(), engine.clone());
            if let Err(e) = server.run(cancel.clone()).await {
                error!(error = %e, "Gateway error");
                cancel.cancel();
                return Err(e);
            }
        }
    }

    Ok(())
}
