//! Host-directory sandbox with no isolation.
//!
//! Runs commands directly on the host under `bash -c`. Each command gets its
//! own process group so a timeout can kill everything it spawned.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::output::{split_exit_sentinel, wrap_command};
use super::{patch_script, CommandResult, EnvironmentInfo, Sandbox, SandboxError, SessionLimits};

/// A sandbox session over a host directory.
pub(crate) struct LocalSession {
    workdir: PathBuf,
    limits: SessionLimits,
    baseline: Option<String>,
    started: bool,
}

impl LocalSession {
    pub fn new(workdir: impl Into<PathBuf>, limits: SessionLimits) -> Self {
        Self {
            workdir: workdir.into(),
            limits,
            baseline: None,
            started: false,
        }
    }

    fn workdir_str(&self) -> String {
        self.workdir.display().to_string()
    }

    /// Runs a git command in the working directory, returning stdout on success.
    async fn git(&self, args: &[&str]) -> Result<Option<String>, SandboxError> {
        self.git_with_index(args, None).await
    }

    /// Like [`Self::git`], with `GIT_INDEX_FILE` pointed at `index` when given.
    async fn git_with_index(
        &self,
        args: &[&str],
        index: Option<&Path>,
    ) -> Result<Option<String>, SandboxError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null());
        if let Some(index) = index {
            command.env("GIT_INDEX_FILE", index);
        }
        let output = command
            .output()
            .await
            .map_err(|e| SandboxError::provisioning(format!("failed to run git: {e}")))?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            debug!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(None)
        }
    }

    /// Commits the working tree as it is now, uncommitted edits included,
    /// without moving HEAD or touching the caller's index. A directory
    /// outside git is initialised first.
    async fn snapshot_baseline(&self) -> Result<String, SandboxError> {
        if self.git(&["rev-parse", "--git-dir"]).await?.is_none() {
            self.git(&["init", "-q"])
                .await?
                .ok_or_else(|| SandboxError::provisioning("git init failed"))?;
        }
        let parent = self.git(&["rev-parse", "-q", "--verify", "HEAD"]).await?;

        let index = std::env::temp_dir().join(format!(
            "fixloop-index-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let tree = self.write_tree(&index, parent.as_deref()).await;
        if let Err(e) = tokio::fs::remove_file(&index).await {
            debug!("remove {}: {}", index.display(), e);
        }
        let tree = tree?;

        let mut args = vec![
            "-c",
            "user.name=fixloop",
            "-c",
            "user.email=fixloop@localhost",
            "-c",
            "commit.gpgsign=false",
            "commit-tree",
            tree.as_str(),
        ];
        if let Some(parent) = parent.as_deref() {
            args.extend(["-p", parent]);
        }
        args.extend(["-m", "fixloop baseline"]);
        self.git(&args)
            .await?
            .ok_or_else(|| SandboxError::provisioning("baseline commit failed"))
    }

    /// Writes the working tree into `index`, seeded from `parent` so tracked
    /// files matching an ignore rule are kept, and returns the tree id.
    async fn write_tree(&self, index: &Path, parent: Option<&str>) -> Result<String, SandboxError> {
        if let Some(parent) = parent {
            self.git_with_index(&["read-tree", parent], Some(index))
                .await?
                .ok_or_else(|| SandboxError::provisioning("git read-tree failed"))?;
        }
        self.git_with_index(&["add", "-A"], Some(index))
            .await?
            .ok_or_else(|| SandboxError::provisioning("git add failed"))?;
        self.git_with_index(&["write-tree"], Some(index))
            .await?
            .ok_or_else(|| SandboxError::provisioning("git write-tree failed"))
    }

    /// Runs a wrapped script, returning raw output, whether the deadline hit,
    /// and the elapsed time. Output read before a timeout is kept.
    async fn run_script(
        &self,
        script: String,
        timeout: Duration,
    ) -> Result<(String, bool, Duration), SandboxError> {
        if !self.started {
            return Err(SandboxError::NotStarted);
        }

        let started = Instant::now();
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::exec_failed(format!("failed to spawn bash: {e}")))?;

        let pid = child.id();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::exec_failed("stdout not captured"))?;

        let mut raw = Vec::new();
        let outcome = {
            let child = &mut child;
            let raw = &mut raw;
            tokio::time::timeout(timeout, async move {
                stdout.read_to_end(raw).await?;
                child.wait().await
            })
            .await
        };

        let deadline_hit = match outcome {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                return Err(SandboxError::exec_failed(format!("reading output: {e}")));
            }
            Err(_) => {
                warn!(
                    workdir = %self.workdir.display(),
                    timeout_secs = timeout.as_secs(),
                    "Command timed out, killing process group"
                );
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                if let Err(e) = child.kill().await {
                    debug!("kill after timeout: {}", e);
                }
                true
            }
        };

        Ok((
            String::from_utf8_lossy(&raw).into_owned(),
            deadline_hit,
            started.elapsed(),
        ))
    }
}

async fn kill_process_group(pid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!("Failed to kill process group {}: {}", pid, e);
    }
}

#[async_trait]
impl Sandbox for LocalSession {
    fn environment(&self) -> EnvironmentInfo {
        let workdir = self.workdir_str();
        EnvironmentInfo {
            backend: "local".to_string(),
            handle: workdir.clone(),
            workdir,
        }
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        if !Path::new(&self.workdir).is_dir() {
            return Err(SandboxError::provisioning(format!(
                "working directory does not exist: {}",
                self.workdir.display()
            )));
        }

        let baseline = self.snapshot_baseline().await?;
        info!(
            workdir = %self.workdir.display(),
            baseline = %baseline,
            "Local sandbox ready"
        );
        self.baseline = Some(baseline);
        self.started = true;
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        timeout_secs: Option<i64>,
    ) -> Result<CommandResult, SandboxError> {
        let timeout = self.limits.effective_timeout(timeout_secs);
        debug!(timeout_secs = timeout.as_secs(), "exec: {}", command);
        let script = wrap_command(command, &self.workdir_str(), None);
        let (raw, deadline_hit, elapsed) = self.run_script(script, timeout).await?;
        Ok(CommandResult::from_raw(&raw, deadline_hit, elapsed))
    }

    async fn get_patch(&self) -> Result<String, SandboxError> {
        let script = wrap_command(
            &patch_script(self.baseline.as_deref()),
            &self.workdir_str(),
            None,
        );
        let (raw, deadline_hit, _) = self
            .run_script(script, self.limits.hard_cap())
            .await
            .map_err(|e| SandboxError::patch_capture(e.to_string()))?;
        if deadline_hit {
            return Err(SandboxError::patch_capture("git diff timed out"));
        }

        let (body, code) = split_exit_sentinel(&raw);
        match code {
            Some(0) => Ok(body.trim().to_string()),
            _ => Err(SandboxError::patch_capture(body.trim().to_string())),
        }
    }

    async fn cleanup(&mut self) -> Result<(), SandboxError> {
        // Nothing to release; the directory belongs to the caller.
        self.started = false;
        Ok(())
    }
}
