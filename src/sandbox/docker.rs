//! Docker-backed sandbox session.
//!
//! One container per task attempt, kept alive with `tail -f /dev/null` and
//! driven through the exec API. Timed-out commands are killed from a second
//! exec using the pid file written by the command wrapper.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::output::{kill_tree_script, wrap_command};
use super::{
    patch_script, CommandResult, EnvironmentInfo, NetworkPolicy, Sandbox, SandboxError,
    SessionLimits, MANAGED_LABEL,
};
use crate::config::Mount;

/// Timeout for internal housekeeping execs (baseline lookup, kills).
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `start()` waits for the container to report running.
const READY_ATTEMPTS: u32 = 40;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Container settings resolved for one task.
#[derive(Debug, Clone)]
pub(crate) struct DockerSettings {
    /// Image to run.
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// Optional user to run commands as.
    pub user: Option<String>,
    /// Memory limit (e.g. "8g").
    pub memory: String,
    /// CPU limit (e.g. "4").
    pub cpus: String,
    /// Network policy.
    pub network: NetworkPolicy,
    /// Extra volume mounts.
    pub mounts: Vec<Mount>,
    /// Run identifier, stored as a container label.
    pub run_id: String,
}

/// A sandbox session backed by one Docker container.
pub(crate) struct DockerSession {
    docker: Docker,
    settings: DockerSettings,
    limits: SessionLimits,
    container_name: String,
    container_id: Option<String>,
    baseline: Option<String>,
}

impl DockerSession {
    pub fn new(docker: Docker, settings: DockerSettings, limits: SessionLimits, task_id: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let container_name = format!("fixloop-{}-{}", sanitize_name(task_id), &suffix[..8]);
        Self {
            docker,
            settings,
            limits,
            container_name,
            container_id: None,
            baseline: None,
        }
    }

    fn build_container_config(&self) -> Result<ContainerConfig<String>, SandboxError> {
        let settings = &self.settings;

        let mut binds = Vec::new();
        for mount in &settings.mounts {
            let host_path = expand_path(&mount.host)?;
            let mode = if mount.readonly { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{}", host_path, mount.container, mode));
        }

        let memory = parse_memory_limit(&settings.memory)?;
        let nano_cpus = parse_cpu_limit(&settings.cpus)?;

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            ("fixloop.run_id".to_string(), settings.run_id.clone()),
        ]);

        Ok(ContainerConfig {
            image: Some(settings.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            working_dir: Some(settings.workdir.clone()),
            user: settings.user.clone(),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                network_mode: settings.network.network_mode(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn wait_until_running(&self, container: &str) -> Result<(), SandboxError> {
        for _ in 0..READY_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_container(container, None)
                .await
                .map_err(|e| SandboxError::provisioning(format!("inspect failed: {e}")))?;
            let running = inspect
                .state
                .as_ref()
                .and_then(|state| state.running)
                .unwrap_or(false);
            if running {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(SandboxError::provisioning(format!(
            "container {} never reached the running state",
            self.container_name
        )))
    }

    /// Runs `script` under bash and returns raw output, whether the deadline
    /// hit, and the elapsed time.
    async fn run_script(
        &self,
        script: String,
        timeout: Duration,
        pid_file: Option<&str>,
    ) -> Result<(String, bool, Duration), SandboxError> {
        let container = self.container_id.as_deref().ok_or(SandboxError::NotStarted)?;

        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: self.settings.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::exec_failed(format!("create exec: {e}")))?;

        let started = Instant::now();
        let mut raw = Vec::new();

        let deadline_hit = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::exec_failed(format!("start exec: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                tokio::time::timeout(timeout, drain_exec_output(&mut output, &mut raw))
                    .await
                    .is_err()
            }
            StartExecResults::Detached => false,
        };

        if deadline_hit {
            warn!(
                container = %self.container_name,
                timeout_secs = timeout.as_secs(),
                "Command timed out, killing exec process tree"
            );
            if let Some(pid_file) = pid_file {
                self.kill_exec(container, pid_file).await;
            }
        }

        Ok((
            String::from_utf8_lossy(&raw).into_owned(),
            deadline_hit,
            started.elapsed(),
        ))
    }

    /// Kills whatever the timed-out exec left running. Best effort.
    async fn kill_exec(&self, container: &str, pid_file: &str) {
        let exec = match self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        kill_tree_script(pid_file),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some("root".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(e) => {
                warn!("Failed to create kill exec: {}", e);
                return;
            }
        };

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { mut output, .. }) => {
                let mut sink = Vec::new();
                let _ = tokio::time::timeout(
                    HOUSEKEEPING_TIMEOUT,
                    drain_exec_output(&mut output, &mut sink),
                )
                .await;
            }
            Ok(StartExecResults::Detached) => {}
            Err(e) => warn!("Failed to start kill exec: {}", e),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSession {
    fn environment(&self) -> EnvironmentInfo {
        EnvironmentInfo {
            backend: "docker".to_string(),
            handle: self.container_name.clone(),
            workdir: self.settings.workdir.clone(),
        }
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        info!(
            container = %self.container_name,
            image = %self.settings.image,
            "Starting sandbox container"
        );

        if let Err(e) = self.docker.inspect_image(&self.settings.image).await {
            return Err(if is_not_found(&e) {
                SandboxError::image_not_found(&self.settings.image)
            } else {
                SandboxError::docker_unavailable(e.to_string())
            });
        }

        let config = self.build_container_config()?;

        debug!("Creating container: {}", self.container_name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::provisioning(format!("create container: {e}")))?;
        // Recorded before starting so cleanup() can remove a half-started container.
        self.container_id = Some(created.id.clone());

        debug!("Starting container");
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| SandboxError::provisioning(format!("start container: {e}")))?;

        self.wait_until_running(&created.id).await?;

        let (raw, _, _) = self
            .run_script(
                wrap_command("git rev-parse HEAD", &self.settings.workdir, None),
                HOUSEKEEPING_TIMEOUT,
                None,
            )
            .await?;
        let head = CommandResult::from_raw(&raw, false, Duration::ZERO);
        self.baseline = (head.exit_code == 0).then(|| head.output.trim().to_string());
        if self.baseline.is_none() {
            warn!(
                container = %self.container_name,
                "Working directory has no git HEAD; patches will diff against the index"
            );
        }

        info!(container = %self.container_name, "Sandbox container ready");
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        timeout_secs: Option<i64>,
    ) -> Result<CommandResult, SandboxError> {
        let timeout = self.limits.effective_timeout(timeout_secs);
        let pid_file = format!("/tmp/fixloop-exec-{}.pid", uuid::Uuid::new_v4().simple());
        let script = wrap_command(command, &self.settings.workdir, Some(&pid_file));

        debug!(container = %self.container_name, timeout_secs = timeout.as_secs(), "exec: {}", command);
        let (raw, deadline_hit, elapsed) = self.run_script(script, timeout, Some(&pid_file)).await?;
        Ok(CommandResult::from_raw(&raw, deadline_hit, elapsed))
    }

    async fn get_patch(&self) -> Result<String, SandboxError> {
        let script = wrap_command(
            &patch_script(self.baseline.as_deref()),
            &self.settings.workdir,
            None,
        );
        let (raw, deadline_hit, _) = self
            .run_script(script, self.limits.hard_cap(), None)
            .await
            .map_err(|e| SandboxError::patch_capture(e.to_string()))?;
        if deadline_hit {
            return Err(SandboxError::patch_capture("git diff timed out"));
        }

        // Parse without truncation: a clipped diff would not apply.
        let (body, code) = super::output::split_exit_sentinel(&raw);
        match code {
            Some(0) => Ok(body.trim().to_string()),
            _ => Err(SandboxError::patch_capture(body.trim().to_string())),
        }
    }

    async fn cleanup(&mut self) -> Result<(), SandboxError> {
        let Some(id) = self.container_id.take() else {
            return Ok(());
        };

        debug!("Removing container {}", self.container_name);
        match self
            .docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::cleanup(format!(
                "remove {}: {e}",
                self.container_name
            ))),
        }
    }
}

impl Drop for DockerSession {
    fn drop(&mut self) {
        // Reached when a task future is cancelled before cleanup() ran.
        let Some(id) = self.container_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to remove container {}", self.container_name);
            return;
        };
        let docker = self.docker.clone();
        let name = self.container_name.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&id, Some(options)).await {
                warn!("Failed to remove container {} on drop: {}", name, e);
            }
        });
    }
}

/// Removes every container labelled as managed by this tool.
///
/// Returns the number of containers removed.
pub(crate) async fn remove_orphaned(docker: &Docker) -> anyhow::Result<u32> {
    let filters = HashMap::from([(
        "label".to_string(),
        vec![format!("{MANAGED_LABEL}=true")],
    )]);
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;

    let mut removed = 0;
    for container in containers {
        let Some(id) = container.id else { continue };
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_container(&id, Some(options)).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
        }
    }
    Ok(removed)
}

async fn drain_exec_output<S>(stream: &mut S, buf: &mut Vec<u8>)
where
    S: Stream<Item = Result<LogOutput, DockerError>> + Unpin,
{
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message },
            ) => buf.extend_from_slice(&message),
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                warn!("Error reading exec output: {}", e);
                break;
            }
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String, SandboxError> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| SandboxError::provisioning("could not determine home directory"))?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.to_lowercase();
    let invalid = |_| SandboxError::provisioning(format!("invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(invalid)?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(invalid)?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(invalid)
    }
}

/// Converts a CPU count such as `"1.5"` into Docker nano-CPUs.
fn parse_cpu_limit(cpus: &str) -> Result<i64, SandboxError> {
    let invalid = || SandboxError::provisioning(format!("invalid cpu limit: '{cpus}'"));
    let count: f64 = cpus.trim().parse().map_err(|_| invalid())?;
    if !count.is_finite() || count <= 0.0 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation)]
    let nano_cpus = (count * 1_000_000_000.0) as i64;
    Ok(nano_cpus)
}
