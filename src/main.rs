use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline_orchestrator::config::Config;
use pipeline_orchestrator::orchestrator::{BatchRunOptions, Orchestrator, RunOptions};
use pipeline_orchestrator::ui::OrchestratorUI;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(version, about = "Audiobook production pipeline orchestrator")]
struct Cli {
    /// Project directory. Defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single input through the phase pipeline
    Run {
        input_file: PathBuf,

        /// Comma-separated phase keys. Defaults to phase1..phase5.
        #[arg(long, value_delimiter = ',')]
        phases: Vec<String>,

        /// Override the state file location (default: <project-dir>/pipeline.json).
        #[arg(long)]
        pipeline_json: Option<PathBuf>,

        #[arg(long)]
        no_resume: bool,

        /// Defaults to the config's max_retries (PIPELINE_MAX_RETRIES or pipeline.toml).
        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        voice: Option<String>,

        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        enable_subtitles: bool,

        #[arg(long)]
        concat_only: bool,
    },
    /// Run several inputs, bounded by a worker pool
    Batch {
        input_files: Vec<PathBuf>,

        #[arg(long, value_delimiter = ',')]
        phases: Vec<String>,

        #[arg(long)]
        no_resume: bool,

        /// Defaults to the config's max_retries (PIPELINE_MAX_RETRIES or pipeline.toml).
        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        voice: Option<String>,

        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        enable_subtitles: bool,

        #[arg(long, default_value = "1")]
        max_workers: usize,
    },
    /// Show the current pipeline.json status summary
    Status {
        #[arg(long)]
        pipeline_json: Option<PathBuf>,
    },
    /// Show recent transaction log entries
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List available state backups
    Backups {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the advisor's current tuning advice
    Advise {
        /// Restrict to a single phase key
        #[arg(long)]
        phase: Option<String>,

        /// Render a human-readable Markdown report instead of JSON
        #[arg(long)]
        report: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = || {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("orchestrator=info".parse().unwrap())
    };
    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
        }
    }
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    let mut config = Config::new(project_dir)?;
    config.ensure_directories()?;

    match cli.command {
        Commands::Run {
            input_file,
            phases,
            pipeline_json,
            no_resume,
            max_retries,
            voice,
            engine,
            enable_subtitles,
            concat_only,
        } => {
            if let Some(path) = pipeline_json {
                config.state_file = path;
            }
            let max_retries = max_retries.unwrap_or(config.max_retries);
            let orchestrator = Orchestrator::new(config);
            let total_phases = if phases.is_empty() {
                pipeline_orchestrator::orchestrator::DEFAULT_PHASES.len()
            } else {
                phases.len()
            } + enable_subtitles as usize;
            let opts = RunOptions {
                input_file,
                phases,
                resume: !no_resume,
                max_retries,
                voice,
                engine,
                enable_subtitles,
                concat_only,
            };
            let ui = OrchestratorUI::new(total_phases as u64, false);
            let progress = |phase: &str, pct: u8, msg: &str| match (pct, msg) {
                (0, "starting") => ui.start_phase(phase),
                (100, "skipped (reuse)") => ui.phase_skipped(phase),
                (100, "complete") => ui.phase_success(phase, std::time::Duration::ZERO),
                _ => ui.phase_progress(phase, pct, msg),
            };
            let summary = orchestrator.run(&opts, Some(&progress), None).await?;
            if summary.success {
                ui.run_complete(summary.audiobook_path.as_deref().and_then(|p| p.to_str()));
            } else {
                ui.phase_failed(
                    summary.phase_results.last().map(|r| r.phase.as_str()).unwrap_or("?"),
                    summary.error.as_deref().unwrap_or("unknown error"),
                );
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.success {
                std::process::exit(1);
            }
        }
        Commands::Batch {
            input_files,
            phases,
            no_resume,
            max_retries,
            voice,
            engine,
            enable_subtitles,
            max_workers,
        } => {
            let max_retries = max_retries.unwrap_or(config.max_retries);
            let orchestrator = Orchestrator::new(config);
            let opts = BatchRunOptions {
                inputs: input_files,
                phases,
                resume: !no_resume,
                max_retries,
                voice,
                engine,
                enable_subtitles,
                max_workers,
            };
            let progress = |file_id: &str, pct: u8, msg: &str| {
                println!("[{file_id}] {pct:>3}% {msg}");
            };
            let summary = orchestrator.run_batch(&opts, Some(&progress)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Status { pipeline_json } => {
            if let Some(path) = pipeline_json {
                config.state_file = path;
            }
            let orchestrator = Orchestrator::new(config);
            let summary = orchestrator.state().get_status_summary()?;
            for (phase, status) in summary {
                println!("{phase:<12} {status}");
            }
        }
        Commands::History { limit } => {
            let orchestrator = Orchestrator::new(config);
            for entry in orchestrator.state().get_transaction_history(limit)? {
                println!("{entry:?}");
            }
        }
        Commands::Backups { limit } => {
            let orchestrator = Orchestrator::new(config);
            for entry in orchestrator.state().list_backups(limit)? {
                println!("{entry:?}");
            }
        }
        Commands::Advise { phase, report } => {
            let orchestrator = Orchestrator::new(config);
            if report {
                println!("{}", orchestrator.advisor().generate_report());
            } else {
                let mut bundle = orchestrator.advisor().advise();
                if let Some(phase) = phase {
                    bundle.telemetry.phase_duration_ms.retain(|k, _| *k == phase);
                }
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            }
        }
    }

    Ok(())
}
