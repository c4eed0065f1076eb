//! Batch runner.
//!
//! Loads the task file, skips tasks already recorded in `results.jsonl`,
//! and runs the rest with up to `max_workers` attempts in flight. Every
//! attempt yields exactly one record, whatever goes wrong inside it.

use anyhow::{Context, Result};
use bollard::Docker;
use colored::Colorize;
use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{AgentLoop, AgentResult, LoopLimits};
use crate::config::{Config, SandboxRuntime};
use crate::metrics::{aggregate, AgentMetrics, ExitReason};
use crate::oracle::{resolve_backend, Registry};
use crate::results::{run_dir, validate_path_component, write_summary, write_task_artifacts, ResultLog};
use crate::sandbox::{DockerSession, DockerSettings, LocalSession, Sandbox, SandboxError};
use crate::task::{load_tasks, Task};

use super::summarize::format_summary;

/// Options for `fixloop run`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOptions {
    pub tasks: PathBuf,
    pub run_id: String,
    pub config: Option<PathBuf>,
    pub backend: Option<String>,
    pub runtime: Option<SandboxRuntime>,
    pub output_dir: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub max_iterations: Option<u32>,
    pub agent_timeout_secs: Option<u64>,
    pub max_token_budget: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

/// Loads the config file named by the options, or `fixloop.toml` in the
/// current directory, and applies CLI overrides.
pub(crate) fn load_config(options: &RunOptions) -> Result<Config> {
    let mut config = match &options.config {
        Some(path) => Config::load_file(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)?
        }
    };
    apply_overrides(&mut config, options);
    Ok(config)
}

fn apply_overrides(config: &mut Config, options: &RunOptions) {
    if let Some(runtime) = options.runtime {
        config.sandbox.runtime = runtime;
    }
    if let Some(dir) = &options.output_dir {
        config.run.output_dir.clone_from(dir);
    }
    if let Some(n) = options.max_workers {
        config.run.max_workers = n;
    }
    if let Some(n) = options.max_iterations {
        config.agent.max_iterations = n;
    }
    if let Some(secs) = options.agent_timeout_secs {
        config.agent.agent_timeout_secs = secs;
    }
    if let Some(budget) = options.max_token_budget {
        config.agent.max_token_budget = budget;
    }
    if let Some(secs) = options.command_timeout_secs {
        config.sandbox.command_timeout_secs = secs;
    }
}

/// Directory that holds the per-run logs and artifacts.
pub(crate) fn resolve_run_dir(options: &RunOptions) -> Result<PathBuf> {
    validate_path_component("run id", &options.run_id)?;
    let config = load_config(options)?;
    Ok(run_dir(&config.run.output_dir, &options.run_id))
}

// -----------------------------------------------------------------------------
// Per-task execution
// -----------------------------------------------------------------------------

struct TaskRunner {
    agent: AgentLoop,
    config: Config,
    docker: Option<Docker>,
    run_id: String,
}

impl TaskRunner {
    fn build_session(&self, task: &Task) -> Result<Box<dyn Sandbox>, SandboxError> {
        let sandbox = &self.config.sandbox;
        let limits = sandbox.limits();
        debug!(
            runtime = %sandbox.runtime,
            command_timeout_secs = limits.default_timeout().as_secs(),
            max_command_timeout_secs = limits.hard_cap().as_secs(),
            "Building sandbox session"
        );

        match sandbox.runtime {
            SandboxRuntime::Docker => {
                let docker = self
                    .docker
                    .clone()
                    .ok_or_else(|| SandboxError::docker_unavailable("no Docker client"))?;
                let settings = DockerSettings {
                    image: task
                        .image
                        .clone()
                        .unwrap_or_else(|| sandbox.image_for(&task.task_id)),
                    workdir: task.workdir.clone().unwrap_or_else(|| sandbox.workdir.clone()),
                    user: sandbox.user.clone(),
                    memory: sandbox.resources.memory.clone(),
                    cpus: sandbox.resources.cpus.clone(),
                    network: sandbox.network,
                    mounts: sandbox.mounts.clone(),
                    run_id: self.run_id.clone(),
                };
                Ok(Box::new(DockerSession::new(
                    docker,
                    settings,
                    limits,
                    &task.task_id,
                )))
            }
            SandboxRuntime::Local => {
                let workdir = task
                    .workdir
                    .as_ref()
                    .map_or_else(|| sandbox.local_root.join(&task.task_id), PathBuf::from);
                Ok(Box::new(LocalSession::new(workdir, limits)))
            }
        }
    }

    async fn run_task(&self, task: Task) -> AgentResult {
        let backend = self.agent.backend();

        if let Err(e) = validate_path_component("task id", &task.task_id) {
            error!(event = "invalid_task", "{}", e);
            return AgentResult::failed(&task.task_id, backend);
        }

        let mut session = match self.build_session(&task) {
            Ok(session) => session,
            Err(e) => {
                error!(event = sandbox_failure_event(&e), "{}", e);
                return AgentResult::failed(&task.task_id, backend);
            }
        };

        info!(event = "task_started", repo = %task.repo, "Starting task");
        let result = match session.start().await {
            Ok(()) => self.agent.run(&task, session.as_ref()).await,
            Err(e) => {
                error!(event = sandbox_failure_event(&e), "{}", e);
                AgentResult::failed(&task.task_id, backend)
            }
        };

        if let Err(e) = session.cleanup().await {
            warn!(event = "cleanup_failed", "{}", e);
        }
        result
    }
}

/// Log event for a sandbox that could not be built or started.
fn sandbox_failure_event(e: &SandboxError) -> &'static str {
    if e.is_docker_unavailable() {
        "docker_unavailable"
    } else if e.is_provisioning() {
        "provisioning_failed"
    } else {
        "sandbox_start_failed"
    }
}

// -----------------------------------------------------------------------------
// Formatting
// -----------------------------------------------------------------------------

/// One progress line per finished task.
pub(crate) fn format_task_line(record: &AgentResult, done: usize, total: usize) -> String {
    let reason = match record.exit_reason {
        ExitReason::Completed => record.exit_reason.to_string().green(),
        ExitReason::GaveUp | ExitReason::MaxIterations | ExitReason::TokenBudget => {
            record.exit_reason.to_string().yellow()
        }
        ExitReason::Timeout | ExitReason::Error => record.exit_reason.to_string().red(),
    };
    let patch = if record.metrics.patch_produced {
        format!("{} bytes", record.metrics.patch_size_bytes).cyan()
    } else {
        "no patch".dimmed()
    };
    format!(
        "[{done}/{total}] {} {reason} ({patch}, {} iterations, {:.1}s)",
        record.task_id.bold(),
        record.metrics.iterations,
        record.metrics.wall_clock_seconds
    )
}

// -----------------------------------------------------------------------------
// Entry point
// -----------------------------------------------------------------------------

/// Runs every pending task and writes the run summary.
pub(crate) async fn run(options: RunOptions) -> Result<()> {
    validate_path_component("run id", &options.run_id)?;
    let config = load_config(&options)?;

    let backend = resolve_backend(&config, options.backend.as_deref())?;
    let oracle = Registry::new()
        .create(backend, &config)
        .with_context(|| format!("Failed to initialise backend '{backend}'"))?;

    let tasks = load_tasks(&options.tasks)?;
    let output_dir = config.run.output_dir.clone();
    let log = ResultLog::new(&output_dir);
    let completed = log.completed_ids()?;

    let pending: Vec<Task> = tasks
        .into_iter()
        .filter(|task| {
            let done = completed.contains(&task.task_id);
            if done {
                info!(task_id = %task.task_id, "Skipping already completed task");
            }
            !done
        })
        .collect();

    let docker = match config.sandbox.runtime {
        SandboxRuntime::Docker => Some(
            Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker. Is Docker running?")?,
        ),
        SandboxRuntime::Local => None,
    };

    let total = pending.len();
    let workers = config.run.max_workers.max(1);
    info!(
        event = "run_started",
        run_id = %options.run_id,
        backend = %backend,
        runtime = %config.sandbox.runtime,
        tasks = total,
        skipped = completed.len(),
        workers,
        "Starting run"
    );

    let runner = TaskRunner {
        agent: AgentLoop::new(oracle, LoopLimits::from_config(&config.agent)),
        config,
        docker,
        run_id: options.run_id.clone(),
    };
    let run_dir = run_dir(&output_dir, &options.run_id);

    let mut finished = stream::iter(pending)
        .map(|task| {
            let span = info_span!("task", task_id = %task.task_id);
            runner.run_task(task).instrument(span)
        })
        .buffer_unordered(workers);

    let mut metrics: Vec<AgentMetrics> = Vec::with_capacity(total);
    while let Some(record) = finished.next().await {
        log.append(&record)?;
        if let Err(e) = write_task_artifacts(&run_dir, &record) {
            warn!(task_id = %record.task_id, "Failed to write task artifacts: {:#}", e);
        }
        metrics.push(record.metrics.clone());
        println!("{}", format_task_line(&record, metrics.len(), total));
    }

    let summary_path = write_summary(&run_dir, &metrics)?;
    print!("{}", format_summary(aggregate(&metrics).as_ref()));
    println!("  Summary: {}", summary_path.display().to_string().dimmed());
    println!("  Results: {}", log.path().display().to_string().dimmed());

    Ok(())
}
