//! spreadscan CLI
//!
//! `run` executes the scan pipeline into a fresh run directory; `cleanup`
//! evicts old run directories.
//!
//! # Exit Codes
//!
//! - 0: success
//! - 1: I/O error (output directory not writable)
//! - 2: config error / invalid stage selection
//! - 3: stage runtime failure
//! - 4: artifact validation / spec-version mismatch

use std::path::PathBuf;
use std::process::Command as ProcessCommand;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use spreadscan::cleanup::cleanup_output;
use spreadscan::config::{AppConfig, LoadedConfig};
use spreadscan::io::layout::{create_run_layout, generate_run_id, now_iso, write_run_meta, RunMeta};
use spreadscan::mexc::MexcClient;
use spreadscan::obs::metrics::{read_metrics, summarize_api_health};
use spreadscan::obs::EventLogger;
use spreadscan::pipeline::runner::{
    build_stage_plan, run_pipeline, PipelineOptions, RunPipelineArgs, EXIT_CONFIG_ERROR,
    EXIT_IO_ERROR, EXIT_OK,
};
use spreadscan::validation::ValidationMode;

#[derive(Parser)]
#[command(name = "spreadscan", about = "Market-making feasibility scanner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the scan pipeline.
    Run(RunArgs),
    /// Remove old run directories.
    Cleanup(CleanupArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Path to the YAML config.
    #[arg(long)]
    config: PathBuf,
    /// Output directory that holds run directories.
    #[arg(long)]
    output: PathBuf,
    /// Reuse a fixed run id instead of generating one.
    #[arg(long)]
    run_id: Option<String>,
    /// Validate config and stage preconditions without executing.
    #[arg(long)]
    dry_run: bool,
    /// First stage of the window to execute.
    #[arg(long)]
    from: Option<String>,
    /// Last stage of the window to execute.
    #[arg(long)]
    to: Option<String>,
    /// Comma-separated explicit stage list (overrides --from/--to).
    #[arg(long)]
    stages: Option<String>,
    /// Skip stages whose outputs already validate.
    #[arg(long, overrides_with = "no_resume")]
    resume: bool,
    #[arg(long)]
    no_resume: bool,
    /// Re-run stages even when their outputs validate.
    #[arg(long)]
    force: bool,
    /// Stop at the first failing stage.
    #[arg(long, overrides_with = "no_fail_fast")]
    fail_fast: bool,
    #[arg(long)]
    no_fail_fast: bool,
    /// Record failures and keep executing later stages.
    #[arg(long)]
    continue_on_error: bool,
    /// Artifact validation mode for stage pre/postconditions.
    #[arg(long, value_enum)]
    artifact_validation: Option<ValidationMode>,
    /// Log level for console output (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Parser)]
struct CleanupArgs {
    /// Output directory that holds run directories.
    #[arg(long)]
    output: PathBuf,
    /// Remove run directories older than this many days.
    #[arg(long)]
    keep_days: u64,
    /// Always keep this many newest run directories.
    #[arg(long)]
    keep_last: usize,
    /// Print what would be removed without removing.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spreadscan={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn git_commit() -> Option<String> {
    let output = ProcessCommand::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?;
    let commit = commit.trim();
    (!commit.is_empty()).then(|| commit.to_string())
}

async fn run_command(args: RunArgs) -> i32 {
    let run_id = args.run_id.clone().unwrap_or_else(generate_run_id);
    let started_at = now_iso();
    let bootstrap_events = EventLogger::disabled();

    if let Err(err) = std::fs::create_dir_all(&args.output) {
        bootstrap_events.error(
            "output_not_writable",
            "main",
            &format!("Cannot create output directory {}: {err}", args.output.display()),
            json!({}),
        );
        return EXIT_IO_ERROR;
    }

    let LoadedConfig { config, raw } = match AppConfig::load(&args.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            bootstrap_events.error("config_invalid", "main", &err.to_string(), json!({}));
            // Leave a failed run_meta behind so the attempt is traceable.
            let run_dir = args.output.join(format!("run_{run_id}"));
            if std::fs::create_dir(&run_dir).is_ok() {
                let _ = write_run_meta(
                    &run_dir.join("run_meta.json"),
                    &RunMeta {
                        run_id: &run_id,
                        started_at: &started_at,
                        git_commit: git_commit().as_deref(),
                        config: None,
                        config_hash: None,
                        status: "failed",
                        run_health: None,
                        error: Some(&err.to_string()),
                    },
                );
            }
            return EXIT_CONFIG_ERROR;
        }
    };

    let layout = match create_run_layout(&args.output, &run_id, &config) {
        Ok(layout) => layout,
        Err(err) => {
            bootstrap_events.error(
                "output_not_writable",
                "main",
                &format!("Cannot create run directory: {err}"),
                json!({}),
            );
            return EXIT_IO_ERROR;
        }
    };

    let events = match EventLogger::new(&run_id, layout.log_path.as_deref()) {
        Ok(events) => events,
        Err(err) => {
            bootstrap_events.error("output_not_writable", "main", &err.to_string(), json!({}));
            return EXIT_IO_ERROR;
        }
    };

    let commit = git_commit();
    let config_hash = config.config_hash();
    if let Err(err) = write_run_meta(
        &layout.run_meta_path,
        &RunMeta {
            run_id: &run_id,
            started_at: &started_at,
            git_commit: commit.as_deref(),
            config: Some(&raw),
            config_hash: Some(&config_hash),
            status: "running",
            run_health: None,
            error: None,
        },
    ) {
        events.error("run_meta_failed", "main", &err.to_string(), json!({}));
        return EXIT_IO_ERROR;
    }

    events.info(
        "run_started",
        "main",
        "Run initialized",
        json!({"dry_run": args.dry_run, "config_hash": config_hash}),
    );

    let selected: Option<Vec<String>> = args.stages.as_ref().map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    });
    let stage_plan = match build_stage_plan(selected.as_deref(), args.from.as_deref(), args.to.as_deref())
    {
        Ok(plan) => plan,
        Err(err) => {
            events.error("config_invalid", "main", &err, json!({}));
            return EXIT_CONFIG_ERROR;
        }
    };

    let client = match MexcClient::new(config.mexc.clone()) {
        Ok(client) => client,
        Err(err) => {
            events.error("client_init_failed", "main", &err.to_string(), json!({}));
            return EXIT_IO_ERROR;
        }
    };
    let http_metrics = client.metrics();

    let options = PipelineOptions {
        resume: if args.no_resume {
            false
        } else {
            args.resume || config.pipeline.resume
        },
        force: args.force,
        fail_fast: if args.no_fail_fast {
            false
        } else {
            args.fail_fast || config.pipeline.fail_fast
        },
        continue_on_error: args.continue_on_error || config.pipeline.continue_on_error,
        dry_run: args.dry_run,
        artifact_validation: args
            .artifact_validation
            .unwrap_or(config.pipeline.artifact_validation),
    };

    let outcome = run_pipeline(RunPipelineArgs {
        run_dir: &layout.run_dir,
        run_id: &run_id,
        config: &config,
        api: &client,
        http_metrics: Some(http_metrics),
        events: &events,
        metrics_path: &layout.metrics_path,
        stage_plan: &stage_plan,
        options,
    })
    .await;

    let metrics_payload = read_metrics(&layout.metrics_path);
    let health = summarize_api_health(&metrics_payload);
    let status = if outcome.exit_code == EXIT_OK {
        "success"
    } else {
        "failed"
    };
    let _ = write_run_meta(
        &layout.run_meta_path,
        &RunMeta {
            run_id: &run_id,
            started_at: &started_at,
            git_commit: commit.as_deref(),
            config: Some(&raw),
            config_hash: Some(&config_hash),
            status,
            run_health: Some(health.run_health),
            error: None,
        },
    );

    events.info(
        "run_complete",
        "main",
        "Run complete",
        json!({
            "exit_code": outcome.exit_code,
            "degraded": outcome.degraded,
            "run_health": health.run_health,
        }),
    );

    outcome.exit_code
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => {
            init_tracing(&args.log_level);
            run_command(args).await
        }
        Command::Cleanup(args) => {
            init_tracing("info");
            cleanup_output(
                &args.output,
                args.keep_days,
                args.keep_last,
                args.dry_run,
                args.verbose,
            )
        }
    };
    std::process::exit(code);
}
