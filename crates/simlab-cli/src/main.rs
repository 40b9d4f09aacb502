mod demo;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use simlab_runner::{
    CheckpointSummary, CleanTargets, Design, Parallelism, RunConfig, RunPaths, SimError, SimResults, SimRunner,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "simlab", version, about = "Monte Carlo simulation runner")]
struct Cli {
    /// Debug-level logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ParallelArg {
    #[value(name = "sequential")]
    Sequential,
    #[value(name = "replications")]
    Replications,
    #[value(name = "conditions")]
    Conditions,
}

impl From<ParallelArg> for Parallelism {
    fn from(value: ParallelArg) -> Self {
        match value {
            ParallelArg::Sequential => Parallelism::Sequential,
            ParallelArg::Replications => Parallelism::Replications,
            ParallelArg::Conditions => Parallelism::Conditions,
        }
    }
}

/// Locates a run's artifacts: the config file, then command-line overrides.
#[derive(Args, Clone, Debug, Default)]
struct RunTarget {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    filename: Option<String>,
}

impl RunTarget {
    fn load(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(dir) = &self.out_dir {
            config.out_dir = dir.clone();
        }
        if let Some(name) = &self.filename {
            config.filename = name.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in mean-estimation study over a design file.
    Run {
        design: PathBuf,
        #[command(flatten)]
        target: RunTarget,
        #[arg(long)]
        replications: Option<usize>,
        #[arg(long, value_enum)]
        parallel: Option<ParallelArg>,
        #[arg(long)]
        ncores: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        design: PathBuf,
        #[command(flatten)]
        target: RunTarget,
        #[arg(long)]
        json: bool,
    },
    /// Show checkpoint progress and persisted artifacts of a run.
    Status {
        #[command(flatten)]
        target: RunTarget,
        #[arg(long)]
        json: bool,
    },
    /// Regenerate and re-analyse one draw from a saved seed file.
    Replay {
        design: PathBuf,
        #[arg(long)]
        condition: u64,
        #[arg(long)]
        seed_file: PathBuf,
        #[command(flatten)]
        target: RunTarget,
        #[arg(long)]
        json: bool,
    },
    Clean {
        #[command(flatten)]
        target: RunTarget,
        #[arg(long)]
        checkpoint: bool,
        #[arg(long)]
        results: bool,
        #[arg(long)]
        seeds: bool,
        #[arg(long)]
        data: bool,
        #[arg(long)]
        output: bool,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
}

/// What a command printed, and whether the process should report success.
struct Report {
    payload: Option<Value>,
    success: bool,
}

impl Report {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(report) => {
            if let Some(payload) = &report.payload {
                emit_json(payload);
            }
            if !report.success {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Report> {
    match command {
        Commands::Run {
            design,
            target,
            replications,
            parallel,
            ncores,
            json,
        } => {
            let design_path = design;
            let design = Design::load(&design_path)?;
            info!(design = %design_path.display(), conditions = design.len(), "loaded design");
            let mut config = target.load()?;
            if let Some(n) = replications {
                config.replications = n;
            }
            if let Some(p) = parallel {
                config.parallel = p.into();
            }
            if ncores.is_some() {
                config.ncores = ncores;
            }
            let results = SimRunner::new(demo::MeanEstimation, design, config).run()?;
            let success = !results.all_failed();
            if json {
                return Ok(Report {
                    payload: Some(json!({
                        "ok": success,
                        "command": "run",
                        "run": results_to_json(&results),
                    })),
                    success,
                });
            }
            print_results(&results);
            if !success {
                eprintln!("every condition was aborted");
            }
            Ok(Report {
                payload: None,
                success,
            })
        }
        Commands::Describe { design, target, json } => {
            let design = Design::load(&design)?;
            let config = target.load()?;
            config.validate(design.len())?;
            let runner = SimRunner::new(demo::MeanEstimation, design, config);
            let summary = describe_to_json(&runner);
            if json {
                return Ok(Report::done(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                }))));
            }
            print_fields(&summary);
            Ok(Report::done(None))
        }
        Commands::Status { target, json } => {
            let paths = RunPaths::from_config(&target.load()?);
            let progress = simlab_runner::inspect(&paths)?;
            let artifacts = simlab_runner::list_artifacts(&paths)?;
            if json {
                return Ok(Report::done(Some(json!({
                    "ok": true,
                    "command": "status",
                    "output": paths.output().display().to_string(),
                    "output_exists": paths.output().exists(),
                    "checkpoint": progress,
                    "artifacts": artifacts.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                }))));
            }
            println!("output: {}", paths.output().display());
            println!("output_exists: {}", paths.output().exists());
            match &progress {
                Some(summary) => print_checkpoint(summary),
                None => println!("checkpoint: none"),
            }
            println!("artifacts: {}", artifacts.len());
            Ok(Report::done(None))
        }
        Commands::Replay {
            design,
            condition,
            seed_file,
            target,
            json,
        } => {
            let design = Design::load(&design)?;
            let runner = SimRunner::new(demo::MeanEstimation, design, target.load()?);
            let replay = runner.replay(condition, &seed_file)?;
            let warnings: Vec<String> = replay.outcome.warnings().iter().map(|w| w.message.clone()).collect();
            let (analysed, _) = replay.outcome.into_parts();
            let payload = json!({
                "ok": analysed.is_ok(),
                "command": "replay",
                "condition": replay.condition_id,
                "seed": replay.seed,
                "data": replay.data,
                "warnings": warnings,
                "analysis": analysed.as_ref().ok().map(|v| v.to_row()),
                "error": analysed.as_ref().err(),
            });
            if json {
                return Ok(Report::done(Some(payload)));
            }
            print_fields(&payload);
            Ok(Report::done(None))
        }
        Commands::Clean {
            target,
            checkpoint,
            results,
            seeds,
            data,
            output,
            all,
            json,
        } => {
            let paths = RunPaths::from_config(&target.load()?);
            let targets = if all {
                CleanTargets::all()
            } else {
                CleanTargets {
                    checkpoint,
                    results,
                    seeds,
                    generated_data: data,
                    output,
                }
            };
            if targets.is_empty() {
                return Err(anyhow!(
                    "nothing to clean: pass --all or one of --checkpoint, --results, --seeds, --data, --output"
                ));
            }
            let removed = simlab_runner::clean(&paths, targets)?;
            if json {
                return Ok(Report::done(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "removed": removed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                }))));
            }
            if removed.is_empty() {
                println!("nothing to remove");
            }
            for p in &removed {
                println!("removed: {}", p.display());
            }
            Ok(Report::done(None))
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<SimError>() {
        Some(SimError::InvalidConfig(_)) => "invalid_config",
        Some(SimError::OutputExists(_)) => "output_exists",
        Some(SimError::CheckpointMismatch { .. }) => "checkpoint_mismatch",
        Some(SimError::Generation { .. }) => "generation_failed",
        Some(SimError::ConditionTerminated { .. }) => "condition_terminated",
        Some(SimError::WorkerSetup(_)) => "worker_setup_failed",
        Some(SimError::Persistence { .. }) => "persistence_failed",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Status { json, .. }
        | Commands::Replay { json, .. }
        | Commands::Clean { json, .. } => *json,
    }
}

fn results_to_json(results: &SimResults) -> Value {
    json!({
        "output": results.output.display().to_string(),
        "conditions": results.table.len(),
        "aborted": results.aborted(),
        "all_failed": results.all_failed(),
        "meta": results.meta,
        "columns": results.table.columns,
        "rows": results.table.rows,
    })
}

fn describe_to_json<S: simlab_runner::Simulation>(runner: &SimRunner<S>) -> Value {
    let config = runner.config();
    let paths = runner.paths();
    json!({
        "conditions": runner.design().len(),
        "factors": runner.design().factor_names(),
        "replications": config.effective_replications(),
        "max_errors": config.max_errors,
        "parallel": config.parallel.as_str(),
        "worker_id": paths.worker_id,
        "output": paths.output().display().to_string(),
        "checkpoint": paths.checkpoint().display().to_string(),
        "resumable": config.effective_save() && paths.checkpoint().exists(),
        "fingerprint": runner.fingerprint(),
    })
}

fn print_results(results: &SimResults) {
    println!("output: {}", results.output.display());
    println!("conditions: {}", results.table.len());
    println!("elapsed_secs: {:.3}", results.meta.elapsed_secs);
    for row in &results.table.rows {
        let cells: Vec<String> = row
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("  {}", cells.join(" "));
    }
}

fn print_checkpoint(summary: &CheckpointSummary) {
    println!("checkpoint: {}", summary.path.display());
    println!("updated_at: {}", summary.updated_at);
    for c in &summary.conditions {
        println!(
            "  condition {}: {} replications={} errors={} warnings={}",
            c.condition_id,
            c.status.as_str(),
            c.completed_replications,
            c.errors,
            c.warnings
        );
        if let Some(reason) = &c.termination {
            println!("    terminated: {}", reason);
        }
    }
}

fn print_fields(value: &Value) {
    if let Value::Object(map) = value {
        for (k, v) in map {
            match v {
                Value::String(s) => println!("{}: {}", k, s),
                other => println!("{}: {}", k, other),
            }
        }
    }
}
