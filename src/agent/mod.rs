//! Agent control loop.
//!
//! Drives one task: asks the oracle for the next step, executes the
//! requested commands in the sandbox, feeds the results back and stops on
//! the first terminal condition:
//!
//! 1. wall-clock budget spent (`timeout`)
//! 2. iteration cap reached (`max_iterations`)
//! 3. oracle failure (`timeout` or `error`)
//! 4. token budget met (`token_budget`)
//! 5. plain answer or `submit_patch` (`completed`), `give_up` (`gave_up`)
//!
//! The patch is captured once after the loop ends, whatever the reason.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::metrics::{AgentMetrics, ExitReason};
use crate::oracle::{
    Action, Conversation, DecisionOracle, OracleTurn, ToolCall, ToolResult, Turn,
};
use crate::sandbox::{truncate_chars, CommandResult, Sandbox};
use crate::task::Task;
use crate::templates;

/// Command output re-injected into the conversation is cut to this many chars.
pub(crate) const MAX_REINJECTED_CHARS: usize = 50_000;

const SUBMIT_ACK: &str = "Patch submitted successfully.";
const GIVE_UP_ACK: &str = "Acknowledged.";

/// Budgets for one run of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopLimits {
    pub max_iterations: u32,
    pub agent_timeout: Duration,
    /// Total token budget; 0 means unlimited.
    pub max_token_budget: u64,
}

impl LoopLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            agent_timeout: config.agent_timeout(),
            max_token_budget: config.max_token_budget,
        }
    }
}

/// Outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AgentResult {
    pub task_id: String,
    pub backend: String,
    /// Unified diff, absent when nothing changed.
    pub patch: Option<String>,
    pub exit_reason: ExitReason,
    pub metrics: AgentMetrics,
}

impl AgentResult {
    /// Result for an attempt that never reached the loop.
    pub fn failed(task_id: &str, backend: &str) -> Self {
        let mut metrics = AgentMetrics::new(task_id, backend);
        metrics.start_timer();
        metrics.finalize(None, ExitReason::Error);
        Self {
            task_id: task_id.to_string(),
            backend: backend.to_string(),
            patch: None,
            exit_reason: ExitReason::Error,
            metrics,
        }
    }
}

pub(crate) struct AgentLoop {
    oracle: Arc<dyn DecisionOracle>,
    limits: LoopLimits,
}

impl AgentLoop {
    pub fn new(oracle: Arc<dyn DecisionOracle>, limits: LoopLimits) -> Self {
        Self { oracle, limits }
    }

    pub fn backend(&self) -> &'static str {
        self.oracle.name()
    }

    /// Runs the task to a terminal state in a started sandbox.
    pub async fn run(&self, task: &Task, sandbox: &dyn Sandbox) -> AgentResult {
        let mut metrics = AgentMetrics::new(&task.task_id, self.oracle.name());
        metrics.start_timer();

        let mut conversation = Conversation::new(
            Some(sandbox.environment()),
            &task.repo,
            templates::task_prompt(&task.problem_statement),
        );

        let exit_reason = self.drive(&mut conversation, sandbox, &mut metrics).await;

        let patch = match sandbox.get_patch().await {
            Ok(patch) => Some(patch).filter(|p| !p.is_empty()),
            Err(e) => {
                warn!(event = "patch_capture_failed", "Failed to capture patch: {}", e);
                None
            }
        };
        metrics.finalize(patch.as_deref(), exit_reason);

        info!(
            event = "task_finished",
            exit_reason = %exit_reason,
            iterations = metrics.iterations,
            total_tokens = metrics.total_tokens,
            patch_bytes = metrics.patch_size_bytes,
            "Task finished"
        );

        AgentResult {
            task_id: task.task_id.clone(),
            backend: self.oracle.name().to_string(),
            patch,
            exit_reason,
            metrics,
        }
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        sandbox: &dyn Sandbox,
        metrics: &mut AgentMetrics,
    ) -> ExitReason {
        let mut turn_index: u32 = 0;

        loop {
            if metrics.elapsed_seconds() >= self.limits.agent_timeout.as_secs_f64() {
                info!(event = "agent_timeout", "Agent timeout reached");
                return ExitReason::Timeout;
            }
            if turn_index >= self.limits.max_iterations {
                info!(event = "max_iterations", "Iteration cap reached");
                return ExitReason::MaxIterations;
            }

            metrics.iterations = turn_index + 1;
            debug!(iteration = metrics.iterations, "Requesting next action");

            let turn = match self.oracle.next_action(conversation).await {
                Ok(turn) => turn,
                Err(e) if e.is_timeout() => {
                    warn!(event = "oracle_timeout", "{}", e);
                    return ExitReason::Timeout;
                }
                Err(e) => {
                    error!(event = "oracle_error", "{}", e);
                    return ExitReason::Error;
                }
            };

            record_usage(metrics, &turn);
            if !turn.text.is_empty() {
                debug!("Agent: {}", head(&turn.text, 500));
            }
            conversation.push(Turn::Assistant {
                text: turn.text.clone(),
                calls: turn.calls.clone(),
            });

            let spent = metrics.input_tokens + metrics.output_tokens;
            if self.limits.max_token_budget > 0 && spent >= self.limits.max_token_budget {
                info!(
                    event = "token_budget",
                    spent,
                    budget = self.limits.max_token_budget,
                    "Token budget reached"
                );
                return ExitReason::TokenBudget;
            }

            if turn.calls.is_empty() {
                return ExitReason::Completed;
            }

            let mut terminal = None;
            let mut results = Vec::with_capacity(turn.calls.len());
            for call in &turn.calls {
                match self.dispatch(call, sandbox, metrics).await {
                    Ok((result, reason)) => {
                        results.push(result);
                        if let Some(reason) = reason {
                            terminal.get_or_insert(reason);
                        }
                    }
                    Err(reason) => return reason,
                }
            }
            conversation.push(Turn::ToolResults { results });

            if let Some(reason) = terminal {
                return reason;
            }
            turn_index += 1;
        }
    }

    /// Handles one tool call. `Err` carries the exit reason for a failure
    /// that ends the run immediately.
    async fn dispatch(
        &self,
        call: &ToolCall,
        sandbox: &dyn Sandbox,
        metrics: &mut AgentMetrics,
    ) -> Result<(ToolResult, Option<ExitReason>), ExitReason> {
        let reply = |content: String, is_error: bool| ToolResult {
            call_id: call.id.clone(),
            content,
            is_error,
        };

        match &call.action {
            Action::RunCommand { command, timeout } => {
                metrics.commands_executed += 1;
                info!(event = "command", timeout = ?timeout, "$ {}", head(command, 200));
                let result = sandbox.execute(command, *timeout).await.map_err(|e| {
                    if e.is_not_started() {
                        error!(event = "sandbox_not_started", "{}", e);
                    } else {
                        error!(event = "sandbox_error", "Command execution failed: {}", e);
                    }
                    ExitReason::Error
                })?;
                if result.timed_out {
                    metrics.commands_timed_out += 1;
                }
                debug!(
                    exit_code = result.exit_code,
                    timed_out = result.timed_out,
                    output_len = result.output.len(),
                    duration = result.duration_seconds,
                    "Command finished"
                );
                Ok((reply(render_command_result(&result), false), None))
            }
            Action::Submit { reasoning } => {
                info!(event = "submit", "Patch submitted: {}", head(reasoning, 500));
                Ok((reply(SUBMIT_ACK.to_string(), false), Some(ExitReason::Completed)))
            }
            Action::GiveUp { reason } => {
                info!(event = "give_up", "Agent gave up: {}", head(reason, 500));
                Ok((reply(GIVE_UP_ACK.to_string(), false), Some(ExitReason::GaveUp)))
            }
            Action::Unrecognized { name } => {
                warn!(event = "unknown_tool", "Unknown tool: {}", name);
                Ok((reply(format!("Unknown tool: {name}"), true), None))
            }
        }
    }
}

fn record_usage(metrics: &mut AgentMetrics, turn: &OracleTurn) {
    metrics.input_tokens += turn.usage.input_tokens;
    metrics.output_tokens += turn.usage.output_tokens;
    metrics.estimated_cost_usd += turn.cost_usd.unwrap_or(0.0);
    add_steps(&mut metrics.delegated_turns, turn.steps.turns);
    add_steps(&mut metrics.reasoning_steps, turn.steps.reasoning_steps);
    add_steps(&mut metrics.execution_steps, turn.steps.execution_steps);
}

fn add_steps(total: &mut Option<u64>, steps: Option<u64>) {
    if let Some(steps) = steps {
        *total = Some(total.unwrap_or(0) + steps);
    }
}

/// Formats a command result for the oracle.
pub(crate) fn render_command_result(result: &CommandResult) -> String {
    let mut parts = Vec::new();
    if !result.output.is_empty() {
        parts.push(truncate_chars(&result.output, MAX_REINJECTED_CHARS));
    }
    parts.push(format!("Exit code: {}", result.exit_code));
    if result.timed_out {
        parts.push(format!(
            "Command timed out after {:.1}s",
            result.duration_seconds
        ));
    }
    parts.join("\n")
}

fn head(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(i, _)| &text[..i])
}
