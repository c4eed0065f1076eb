use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod commands;
mod config;
mod metrics;
mod oracle;
mod results;
mod sandbox;
mod task;
mod templates;

use commands::run::RunOptions;
use config::SandboxRuntime;

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(
    author,
    version,
    about = "Run autonomous code-fixing agents against per-task sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent over every pending task in a task file
    Run {
        /// Task file (JSON array or JSON Lines)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Run identifier used for log directories and container labels
        #[arg(long)]
        run_id: String,

        /// Config file (defaults to ./fixloop.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Decision backend (hosted, claude-cli, codex-cli, noop)
        #[arg(short, long)]
        backend: Option<String>,

        /// Sandbox runtime (docker, local)
        #[arg(long)]
        runtime: Option<SandboxRuntime>,

        /// Output directory for results and logs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Tasks processed concurrently
        #[arg(short = 'w', long)]
        max_workers: Option<usize>,

        /// Maximum oracle turns per task
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Wall-clock budget per task, in seconds
        #[arg(long)]
        agent_timeout: Option<u64>,

        /// Token budget per task (0 = unlimited)
        #[arg(long)]
        max_token_budget: Option<u64>,

        /// Default per-command timeout, in seconds
        #[arg(long)]
        command_timeout: Option<u64>,
    },

    /// Summarize results.jsonl in an output directory
    Summarize {
        /// Output directory of a previous run
        #[arg(default_value = "runs")]
        dir: PathBuf,
    },

    /// List available decision backends
    Backends,

    /// Remove containers left behind by interrupted runs
    Clean,
}

/// Sets up console logging and, for runs, a JSON log file in the run
/// directory. The returned guard flushes the file on drop.
fn init_logging(verbose: bool, run_log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let default_filter = if verbose { "fixloop=debug" } else { "fixloop=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, guard) = match run_log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(&dir, "run.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tasks,
            run_id,
            config,
            backend,
            runtime,
            output_dir,
            max_workers,
            max_iterations,
            agent_timeout,
            max_token_budget,
            command_timeout,
        } => {
            let options = RunOptions {
                tasks,
                run_id,
                config,
                backend,
                runtime,
                output_dir,
                max_workers,
                max_iterations,
                agent_timeout_secs: agent_timeout,
                max_token_budget,
                command_timeout_secs: command_timeout,
            };
            let run_dir = commands::run::resolve_run_dir(&options)?;
            let _guard = init_logging(cli.verbose, Some(run_dir))?;
            commands::run::run(options).await?;
        }
        Commands::Summarize { dir } => {
            init_logging(cli.verbose, None)?;
            commands::summarize::run(&dir)?;
        }
        Commands::Backends => {
            init_logging(cli.verbose, None)?;
            commands::backends::run()?;
        }
        Commands::Clean => {
            init_logging(cli.verbose, None)?;
            commands::clean::run().await?;
        }
    }

    Ok(())
}
