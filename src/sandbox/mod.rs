//! Sandboxed execution sessions.
//!
//! A session owns one isolated environment for one task attempt. It is the
//! only channel through which an agent touches the outside world: bounded
//! command execution, truncated output capture and change-set extraction.
//!
//! Backends:
//! - `docker`: one long-lived container per task, commands via the exec API
//! - `local`: a host directory with no isolation, for development and tests

mod docker;
mod error;
mod local;
mod network;
mod output;

pub(crate) use docker::{remove_orphaned, DockerSession, DockerSettings};
pub(crate) use error::SandboxError;
pub(crate) use local::LocalSession;
pub(crate) use network::NetworkPolicy;
pub(crate) use output::truncate_chars;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use output::{split_exit_sentinel, truncate_bytes, UNKNOWN_EXIT_CODE};

/// Ceiling on captured command output kept by the sandbox.
pub(crate) const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Hard cap on any single command's timeout.
pub(crate) const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Default per-command timeout when the caller gives none.
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Label put on every container this tool creates.
pub(crate) const MANAGED_LABEL: &str = "fixloop.managed";

/// Outcome of one command. Non-zero exits and timeouts are data, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Combined stdout/stderr, sentinel removed, possibly truncated.
    pub output: String,
    /// Process exit status, or -1 when it could not be recovered.
    pub exit_code: i32,
    /// Whether the command was killed at its deadline.
    pub timed_out: bool,
    /// Wall-clock duration, never negative.
    pub duration_seconds: f64,
}

impl CommandResult {
    /// Builds a result from raw wrapper output.
    ///
    /// The sentinel is parsed before truncation so a large output can never
    /// push it out of reach.
    pub(crate) fn from_raw(raw: &str, deadline_hit: bool, duration: Duration) -> Self {
        let (body, code) = split_exit_sentinel(raw);
        let timed_out = deadline_hit || code.is_none();
        Self {
            output: truncate_bytes(&body, MAX_OUTPUT_BYTES),
            exit_code: code.unwrap_or(UNKNOWN_EXIT_CODE),
            timed_out,
            duration_seconds: duration.as_secs_f64(),
        }
    }
}

/// Per-session timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionLimits {
    default_timeout: Duration,
    hard_cap: Duration,
}

impl SessionLimits {
    /// Creates limits; the default is clamped into `[1s, hard_cap]`.
    pub fn new(default_timeout: Duration, hard_cap: Duration) -> Self {
        let hard_cap = hard_cap.max(Duration::from_secs(1));
        Self {
            default_timeout: default_timeout.clamp(Duration::from_secs(1), hard_cap),
            hard_cap,
        }
    }

    /// Timeout for one command.
    ///
    /// Positive requests are clamped to `[1, hard_cap]` seconds; a missing
    /// or non-positive request uses the session default.
    pub fn effective_timeout(&self, requested_secs: Option<i64>) -> Duration {
        match requested_secs {
            Some(secs) if secs > 0 => {
                let secs = u64::try_from(secs).unwrap_or(u64::MAX);
                Duration::from_secs(secs).clamp(Duration::from_secs(1), self.hard_cap)
            }
            _ => self.default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn hard_cap(&self) -> Duration {
        self.hard_cap
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, MAX_COMMAND_TIMEOUT)
    }
}

/// Read-only description of a session, shown to oracles that drive the
/// environment themselves (for example through `docker exec`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    /// Backend name (`docker` or `local`).
    pub backend: String,
    /// Container name or host directory.
    pub handle: String,
    /// Working directory commands run in.
    pub workdir: String,
}

/// An isolated execution environment for one task attempt.
///
/// Always used as a scoped resource: `start()` on entry and `cleanup()` on
/// every exit path. Both `cleanup()` and `get_patch()` are idempotent.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    /// Describes the environment; meaningful once started.
    fn environment(&self) -> EnvironmentInfo;

    /// Provisions the environment and waits until it accepts commands.
    async fn start(&mut self) -> Result<(), SandboxError>;

    /// Runs `command` in the working directory with a bounded timeout.
    async fn execute(
        &self,
        command: &str,
        timeout_secs: Option<i64>,
    ) -> Result<CommandResult, SandboxError>;

    /// Cumulative diff of the working tree against its starting state.
    /// An empty string means no change.
    async fn get_patch(&self) -> Result<String, SandboxError>;

    /// Releases every resource held by the environment.
    async fn cleanup(&mut self) -> Result<(), SandboxError>;
}

/// Git script that diffs the working tree, new files included, against
/// `baseline`.
///
/// New files are staged into a throwaway index seeded from the baseline, so
/// the checkout's own index is left as it was. Without a baseline commit the
/// diff is taken against the index instead.
pub(crate) fn patch_script(baseline: Option<&str>) -> String {
    match baseline {
        Some(commit) => {
            let commit = shell_words::quote(commit);
            format!(
                "tmp=$(mktemp -d) && export GIT_INDEX_FILE=\"$tmp/index\" && \
                 git read-tree {commit} && git add -A && \
                 git -c core.fileMode=false diff --cached --no-color {commit}; \
                 rc=$?; rm -rf \"$tmp\"; exit $rc"
            )
        }
        None => "git -c core.fileMode=false diff --no-color".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SessionLimits {
        SessionLimits::new(Duration::from_secs(120), Duration::from_secs(600))
    }

    #[test]
    fn test_effective_timeout_clamps_to_hard_cap() {
        for requested in [601, 999_999, i64::MAX] {
            assert_eq!(
                limits().effective_timeout(Some(requested)),
                Duration::from_secs(600)
            );
        }
    }

    #[test]
    fn test_effective_timeout_non_positive_uses_default() {
        for requested in [None, Some(0), Some(-5)] {
            assert_eq!(
                limits().effective_timeout(requested),
                Duration::from_secs(120)
            );
        }
    }

    #[test]
    fn test_effective_timeout_within_range_is_kept() {
        assert_eq!(limits().effective_timeout(Some(1)), Duration::from_secs(1));
        assert_eq!(
            limits().effective_timeout(Some(600)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_session_limits_clamp_default_into_cap() {
        let limits = SessionLimits::new(Duration::from_secs(900), Duration::from_secs(60));
        assert_eq!(limits.default_timeout(), Duration::from_secs(60));
        assert_eq!(limits.hard_cap(), Duration::from_secs(60));
    }

    #[test]
    fn test_command_result_parses_sentinel() {
        let result = CommandResult::from_raw("hi\nFIXLOOP_EXIT:3\n", false, Duration::from_millis(5));
        assert_eq!(result.output, "hi");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(result.duration_seconds >= 0.0);
    }

    #[test]
    fn test_command_result_missing_sentinel_is_timeout() {
        let result = CommandResult::from_raw("partial output", true, Duration::from_secs(2));
        assert_eq!(result.exit_code, -1);
        assert!(result.timed_out);
        assert_eq!(result.output, "partial output");
    }

    #[test]
    fn test_command_result_truncates_after_parsing() {
        let raw = format!("{}\nFIXLOOP_EXIT:0\n", "x".repeat(MAX_OUTPUT_BYTES * 2));
        let result = CommandResult::from_raw(&raw, false, Duration::ZERO);
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("[output truncated:"));
        assert!(!result.output.contains("FIXLOOP_EXIT"));
    }

    #[test]
    fn test_patch_script_with_baseline() {
        let script = patch_script(Some("abc123"));
        assert!(script.contains("export GIT_INDEX_FILE="));
        assert!(script.contains("git read-tree abc123 && git add -A"));
        assert!(script.contains("diff --cached --no-color abc123;"));
        assert!(script.ends_with("exit $rc"));
        assert_eq!(
            patch_script(None),
            "git -c core.fileMode=false diff --no-color"
        );
    }
}
