//! Delegated CLI agents.
//!
//! The agent CLI runs its own tool loop and drives the sandbox directly
//! (through `docker exec` for containers). From the control loop's point of
//! view it is a single oracle call that always returns a plain answer.
//!
//! ```bash
//! claude --print --output-format json --max-budget-usd 1.0 ... "<prompt>"
//! codex exec --json --skip-git-repo-check ... "<prompt>"
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::conversation::{Conversation, DelegatedSteps, OracleTurn, TokenUsage};
use super::env::sanitized_env;
use super::{DecisionOracle, OracleError};
use crate::config::{ClaudeCliConfig, CodexCliConfig};
use crate::templates;

/// Which CLI is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CliFlavor {
    Claude,
    Codex,
}

/// Oracle that hands the whole task to an agent CLI subprocess.
pub(crate) struct LocalCliOracle {
    flavor: CliFlavor,
    program: PathBuf,
    model: Option<String>,
    max_budget_usd: Option<f64>,
    timeout: Duration,
}

impl LocalCliOracle {
    pub fn claude(config: &ClaudeCliConfig, timeout: Duration) -> Result<Self, OracleError> {
        Ok(Self {
            flavor: CliFlavor::Claude,
            program: resolve_program(&config.path)?,
            model: Some(config.model.clone()),
            max_budget_usd: Some(config.max_budget_usd),
            timeout,
        })
    }

    pub fn codex(config: &CodexCliConfig, timeout: Duration) -> Result<Self, OracleError> {
        Ok(Self {
            flavor: CliFlavor::Codex,
            program: resolve_program(&config.path)?,
            model: config.model.clone(),
            max_budget_usd: None,
            timeout,
        })
    }

    /// Command-line arguments and working directory for one run.
    fn invocation(&self, conversation: &Conversation) -> (Vec<String>, PathBuf) {
        let prompt = conversation.task_prompt().unwrap_or_default().to_string();
        let env = conversation.environment.as_ref();
        let in_container = env.is_some_and(|env| env.backend == "docker");

        let (system, allowed_tools, cwd) = match env {
            Some(env) if in_container => (
                templates::delegated_prompt(&conversation.repo, &env.handle, &env.workdir),
                format!("Bash(docker exec {}:*)", env.handle),
                std::env::temp_dir(),
            ),
            Some(env) => (
                templates::system_prompt(&conversation.repo, &env.workdir),
                "Bash Edit Read Write".to_string(),
                PathBuf::from(&env.workdir),
            ),
            None => (
                templates::system_prompt(&conversation.repo, "."),
                "Bash Edit Read Write".to_string(),
                std::env::temp_dir(),
            ),
        };

        let mut args = Vec::new();
        match self.flavor {
            CliFlavor::Claude => {
                args.extend(["--print", "--output-format", "json"].map(String::from));
                if let Some(model) = &self.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                if let Some(budget) = self.max_budget_usd {
                    args.extend(["--max-budget-usd".to_string(), budget.to_string()]);
                }
                args.push("--dangerously-skip-permissions".to_string());
                args.extend(["--system-prompt".to_string(), system]);
                args.extend(["--allowedTools".to_string(), allowed_tools]);
            }
            CliFlavor::Codex => {
                args.extend(
                    [
                        "exec",
                        "--json",
                        "--skip-git-repo-check",
                        "--dangerously-bypass-approvals-and-sandbox",
                    ]
                    .map(String::from),
                );
                if let Some(model) = &self.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                args.extend([
                    "-c".to_string(),
                    format!("developer_instructions={}", toml_string(&system)),
                ]);
            }
        }
        args.push(prompt);
        (args, cwd)
    }
}

#[async_trait]
impl DecisionOracle for LocalCliOracle {
    fn name(&self) -> &'static str {
        match self.flavor {
            CliFlavor::Claude => "claude-cli",
            CliFlavor::Codex => "codex-cli",
        }
    }

    async fn next_action(&self, conversation: &Conversation) -> Result<OracleTurn, OracleError> {
        let (args, cwd) = self.invocation(conversation);
        info!(
            program = %self.program.display(),
            timeout_secs = self.timeout.as_secs(),
            "Launching delegated agent"
        );
        debug!("Delegated agent args: {:?}", &args[..args.len().saturating_sub(1)]);

        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(&cwd)
            .env_clear()
            .envs(sanitized_env(std::env::vars()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OracleError::backend(format!(
                    "failed to launch {}: {e}",
                    self.program.display()
                ))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| OracleError::backend(e.to_string()))?,
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Delegated agent timed out"
                );
                return Err(OracleError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("Delegated agent stderr: {}", head(&stderr, 2000));
        }
        if !output.status.success() {
            return Err(OracleError::backend(format!(
                "{} exited with code {:?}: {}",
                self.name(),
                output.status.code(),
                head(stderr.trim(), 2000)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match self.flavor {
            CliFlavor::Claude => parse_claude_output(&stdout),
            CliFlavor::Codex => Ok(parse_codex_events(&stdout)),
        }
    }
}

// -----------------------------------------------------------------------------
// Output parsing
// -----------------------------------------------------------------------------

/// Parses `claude --output-format json`.
///
/// Falls back to the last line that parses as JSON; output that never
/// parses yields an empty answer with no usage.
pub(crate) fn parse_claude_output(stdout: &str) -> Result<OracleTurn, OracleError> {
    let Some(data) = parse_json_or_last_line(stdout) else {
        warn!(
            "Could not parse delegated agent output as JSON (len={})",
            stdout.len()
        );
        return Ok(OracleTurn::default());
    };

    if data.get("is_error").and_then(Value::as_bool) == Some(true) {
        let message = data
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("delegated agent reported an error");
        return Err(OracleError::backend(message.to_string()));
    }

    let count = |key: &str| {
        data.get("usage")
            .and_then(|usage| usage.get(key))
            .or_else(|| data.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let usage = TokenUsage {
        input_tokens: count("input_tokens"),
        output_tokens: count("output_tokens"),
    };
    let cost_usd = data
        .get("total_cost_usd")
        .or_else(|| data.get("cost_usd"))
        .and_then(Value::as_f64);

    Ok(OracleTurn {
        text: data
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        calls: Vec::new(),
        usage,
        cost_usd,
        steps: DelegatedSteps {
            turns: data.get("num_turns").and_then(Value::as_u64),
            ..Default::default()
        },
    })
}

/// Parses `codex exec --json` JSONL events.
///
/// Token usage is summed over `turn.completed` events. Both step counters
/// advance on completed `reasoning` items; no event type distinguishes
/// execution steps yet. Lines that are not JSON are skipped.
pub(crate) fn parse_codex_events(stdout: &str) -> OracleTurn {
    let mut usage = TokenUsage::default();
    let mut turns = 0;
    let mut reasoning_steps = 0;
    let mut execution_steps = 0;
    let mut last_message = String::new();

    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("turn.completed") => {
                turns += 1;
                if let Some(u) = event.get("usage") {
                    usage.input_tokens += u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    usage.output_tokens +=
                        u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                }
            }
            Some("item.completed") => {
                let Some(item) = event.get("item") else {
                    continue;
                };
                match item.get("type").and_then(Value::as_str) {
                    Some("reasoning") => {
                        reasoning_steps += 1;
                        execution_steps += 1;
                    }
                    Some("agent_message") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            last_message = text.to_string();
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    OracleTurn {
        text: last_message,
        calls: Vec::new(),
        usage,
        cost_usd: None,
        steps: DelegatedSteps {
            turns: Some(turns),
            reasoning_steps: Some(reasoning_steps),
            execution_steps: Some(execution_steps),
        },
    }
}

fn parse_json_or_last_line(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line).ok())
    })
}

/// Locates `path` directly or on `PATH`.
fn resolve_program(path: &str) -> Result<PathBuf, OracleError> {
    let found = if path.contains('/') {
        Some(PathBuf::from(path)).filter(|p| p.is_file())
    } else {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(path))
                .find(|candidate| Path::new(candidate).is_file())
        })
    };
    found.ok_or_else(|| {
        OracleError::missing_dependency(format!(
            "'{path}' not found. Install it or set its path in fixloop.toml"
        ))
    })
}

fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn head(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(i, _)| &text[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::EnvironmentInfo;

    fn oracle(flavor: CliFlavor) -> LocalCliOracle {
        LocalCliOracle {
            flavor,
            program: PathBuf::from("/usr/bin/true"),
            model: Some("sonnet".to_string()),
            max_budget_usd: Some(1.0),
            timeout: Duration::from_secs(5),
        }
    }

    fn docker_conversation() -> Conversation {
        let env = EnvironmentInfo {
            backend: "docker".to_string(),
            handle: "fixloop-django-1".to_string(),
            workdir: "/testbed".to_string(),
        };
        Conversation::new(Some(env), "django/django", "Fix the ordering bug")
    }

    #[test]
    fn test_claude_invocation_restricts_tools_to_container() {
        let (args, cwd) = oracle(CliFlavor::Claude).invocation(&docker_conversation());
        assert_eq!(&args[..3], ["--print", "--output-format", "json"]);
        assert!(args.contains(&"--max-budget-usd".to_string()));
        let allowed = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[allowed + 1], "Bash(docker exec fixloop-django-1:*)");
        assert_eq!(args.last().unwrap(), "Fix the ordering bug");
        assert_eq!(cwd, std::env::temp_dir());
    }

    #[test]
    fn test_codex_invocation_uses_exec_json() {
        let (args, _) = oracle(CliFlavor::Codex).invocation(&docker_conversation());
        assert_eq!(&args[..2], ["exec", "--json"]);
        let instructions = args
            .iter()
            .find(|a| a.starts_with("developer_instructions="))
            .unwrap();
        assert!(instructions.contains("fixloop-django-1"));
    }

    #[test]
    fn test_local_invocation_runs_in_workdir() {
        let env = EnvironmentInfo {
            backend: "local".to_string(),
            handle: "/srv/repo".to_string(),
            workdir: "/srv/repo".to_string(),
        };
        let conversation = Conversation::new(Some(env), "psf/requests", "Fix it");
        let (_, cwd) = oracle(CliFlavor::Claude).invocation(&conversation);
        assert_eq!(cwd, PathBuf::from("/srv/repo"));
    }

    #[test]
    fn test_parse_claude_output() {
        let stdout = r#"{"type":"result","subtype":"success","is_error":false,"result":"Fixed it.","num_turns":12,"total_cost_usd":0.42,"usage":{"input_tokens":1500,"output_tokens":300}}"#;
        let turn = parse_claude_output(stdout).unwrap();
        assert_eq!(turn.text, "Fixed it.");
        assert!(turn.calls.is_empty());
        assert_eq!(turn.usage.input_tokens, 1500);
        assert_eq!(turn.usage.output_tokens, 300);
        assert_eq!(turn.steps.turns, Some(12));
        assert!((turn.cost_usd.unwrap() - 0.42).abs() < 1e-9);
    }

    #[test]
    fn test_parse_claude_output_top_level_usage_and_last_line() {
        let stdout = "progress...\n{\"result\":\"ok\",\"input_tokens\":7,\"output_tokens\":3,\"num_turns\":2}\n";
        let turn = parse_claude_output(stdout).unwrap();
        assert_eq!(turn.usage.input_tokens, 7);
        assert_eq!(turn.usage.output_tokens, 3);
        assert_eq!(turn.steps.turns, Some(2));
    }

    #[test]
    fn test_parse_claude_output_unparseable_is_empty_answer() {
        let turn = parse_claude_output("not json at all").unwrap();
        assert_eq!(turn, OracleTurn::default());
    }

    #[test]
    fn test_parse_claude_output_error_flag() {
        let err = parse_claude_output(r#"{"is_error":true,"result":"budget exceeded"}"#).unwrap_err();
        assert!(err.to_string().contains("budget exceeded"));
    }

    #[test]
    fn test_parse_codex_events() {
        let stdout = r#"{"type":"thread.started","thread_id":"t1"}
{"type":"turn.started"}
{"type":"item.completed","item":{"id":"i0","type":"reasoning","text":"look at tests"}}
{"type":"item.completed","item":{"id":"i1","type":"command_execution","command":"ls","status":"completed"}}
{"type":"item.completed","item":{"id":"i2","type":"reasoning","text":"patch it"}}
{"type":"item.completed","item":{"id":"i3","type":"agent_message","text":"Done."}}
garbage line
{"type":"turn.completed","usage":{"input_tokens":900,"cached_input_tokens":100,"output_tokens":120}}
"#;
        let turn = parse_codex_events(stdout);
        assert_eq!(turn.text, "Done.");
        assert_eq!(turn.usage.input_tokens, 900);
        assert_eq!(turn.usage.output_tokens, 120);
        assert_eq!(turn.steps.turns, Some(1));
        assert_eq!(turn.steps.reasoning_steps, Some(2));
    }

    /// Execution steps currently advance on the same `reasoning` items as
    /// reasoning steps, so a `command_execution` item is not counted. If
    /// the counters are ever split, this test should change with them.
    #[test]
    fn test_codex_execution_steps_follow_reasoning_items() {
        let stdout = r#"{"type":"item.completed","item":{"type":"reasoning"}}
{"type":"item.completed","item":{"type":"command_execution"}}
{"type":"item.completed","item":{"type":"command_execution"}}
"#;
        let turn = parse_codex_events(stdout);
        assert_eq!(turn.steps.reasoning_steps, Some(1));
        assert_eq!(turn.steps.execution_steps, Some(1));
    }

    #[test]
    fn test_resolve_program_missing() {
        let err = resolve_program("definitely-not-a-real-fixloop-binary").unwrap_err();
        assert!(matches!(err, OracleError::MissingDependency { .. }));
        assert!(resolve_program("/nonexistent/claude").is_err());
    }

    #[test]
    fn test_head_truncates_on_chars() {
        assert_eq!(head("héllo", 2), "hé");
        assert_eq!(head("hi", 10), "hi");
    }

    /// Writes an executable shell script standing in for an agent CLI.
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn scripted(program: PathBuf, timeout: Duration) -> LocalCliOracle {
        LocalCliOracle {
            flavor: CliFlavor::Claude,
            program,
            model: None,
            max_budget_usd: None,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_next_action_reads_cli_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_cli(
            dir.path(),
            r#"echo '{"result":"patched","num_turns":4,"usage":{"input_tokens":10,"output_tokens":5}}'"#,
        );
        let oracle = scripted(program, Duration::from_secs(10));

        let turn = oracle.next_action(&docker_conversation()).await.unwrap();
        assert_eq!(turn.text, "patched");
        assert_eq!(turn.steps.turns, Some(4));
        assert!(turn.calls.is_empty());
    }

    #[tokio::test]
    async fn test_next_action_does_not_leak_secrets() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_cli(
            dir.path(),
            r#"printf '{"result":"%s"}' "${ANTHROPIC_API_KEY:-clean}""#,
        );
        std::env::set_var("ANTHROPIC_API_KEY", "sk-should-not-leak");
        let oracle = scripted(program, Duration::from_secs(10));

        let turn = oracle.next_action(&docker_conversation()).await.unwrap();
        assert_eq!(turn.text, "clean");
    }

    #[tokio::test]
    async fn test_next_action_nonzero_exit_is_backend_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_cli(dir.path(), "echo 'not logged in' >&2; exit 1");
        let oracle = scripted(program, Duration::from_secs(10));

        let err = oracle.next_action(&docker_conversation()).await.unwrap_err();
        assert!(matches!(err, OracleError::Backend { .. }));
        assert!(err.to_string().contains("not logged in"));
    }

    #[tokio::test]
    async fn test_next_action_process_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_cli(dir.path(), "sleep 5");
        let oracle = scripted(program, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = oracle.next_action(&docker_conversation()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
