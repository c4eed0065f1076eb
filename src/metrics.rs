//! Per-task telemetry and run-level aggregation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Why a task attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ExitReason {
    /// The oracle submitted or answered without further actions.
    Completed,
    /// The oracle gave up.
    GaveUp,
    /// The iteration cap was reached.
    MaxIterations,
    /// The wall-clock budget ran out, or a delegated backend timed out.
    Timeout,
    /// The token budget was met or exceeded.
    TokenBudget,
    /// Provisioning, oracle or sandbox infrastructure failed.
    Error,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::GaveUp => "gave_up",
            Self::MaxIterations => "max_iterations",
            Self::Timeout => "timeout",
            Self::TokenBudget => "token_budget",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Counters for one task attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct AgentMetrics {
    pub task_id: String,
    pub backend: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub wall_clock_seconds: f64,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub commands_executed: u32,
    pub commands_timed_out: u32,
    pub exit_reason: Option<ExitReason>,
    pub patch_produced: bool,
    pub patch_size_bytes: usize,
    pub estimated_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_turns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_steps: Option<u64>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl AgentMetrics {
    pub fn new(task_id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            backend: backend.into(),
            ..Default::default()
        }
    }

    pub fn start_timer(&mut self) {
        self.start_time = Some(Utc::now());
        self.started_at = Some(Instant::now());
    }

    pub fn stop_timer(&mut self) {
        self.end_time = Some(Utc::now());
        if let Some(started) = self.started_at {
            self.wall_clock_seconds = started.elapsed().as_secs_f64();
        }
    }

    /// Seconds since `start_timer`, or zero if it was never called.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at
            .map_or(0.0, |started| started.elapsed().as_secs_f64())
    }

    /// Stops the timer and derives totals and patch fields.
    pub fn finalize(&mut self, patch: Option<&str>, exit_reason: ExitReason) {
        self.stop_timer();
        self.exit_reason = Some(exit_reason);
        self.total_tokens = self.input_tokens + self.output_tokens;
        match patch {
            Some(patch) if !patch.is_empty() => {
                self.patch_produced = true;
                self.patch_size_bytes = patch.len();
            }
            _ => {
                self.patch_produced = false;
                self.patch_size_bytes = 0;
            }
        }
    }

    /// Writes the metrics as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write metrics: {}", path.display()))?;
        Ok(())
    }
}

/// Run-level totals over many attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MetricsSummary {
    pub num_instances: usize,
    pub patches_produced: usize,
    pub patch_rate: f64,
    pub total_wall_clock_seconds: f64,
    pub avg_wall_clock_seconds: f64,
    pub total_iterations: u64,
    pub avg_iterations: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub avg_tokens_per_instance: f64,
    pub total_commands_executed: u64,
    pub total_commands_timed_out: u64,
    pub total_estimated_cost_usd: f64,
    pub avg_cost_per_instance_usd: f64,
    pub exit_reasons: BTreeMap<String, usize>,
}

/// Aggregates attempts into a summary; `None` for no attempts.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn aggregate(records: &[AgentMetrics]) -> Option<MetricsSummary> {
    if records.is_empty() {
        return None;
    }
    let n = records.len();
    let count = n as f64;

    let total_wall_clock: f64 = records.iter().map(|m| m.wall_clock_seconds).sum();
    let total_iterations: u64 = records.iter().map(|m| u64::from(m.iterations)).sum();
    let total_tokens: u64 = records.iter().map(|m| m.total_tokens).sum();
    let total_cost: f64 = records.iter().map(|m| m.estimated_cost_usd).sum();
    let patches_produced = records.iter().filter(|m| m.patch_produced).count();

    let mut exit_reasons = BTreeMap::new();
    for m in records {
        let reason = m
            .exit_reason
            .map_or_else(|| "unknown".to_string(), |r| r.to_string());
        *exit_reasons.entry(reason).or_insert(0) += 1;
    }

    Some(MetricsSummary {
        num_instances: n,
        patches_produced,
        patch_rate: patches_produced as f64 / count,
        total_wall_clock_seconds: total_wall_clock,
        avg_wall_clock_seconds: total_wall_clock / count,
        total_iterations,
        avg_iterations: total_iterations as f64 / count,
        total_input_tokens: records.iter().map(|m| m.input_tokens).sum(),
        total_output_tokens: records.iter().map(|m| m.output_tokens).sum(),
        total_tokens,
        avg_tokens_per_instance: total_tokens as f64 / count,
        total_commands_executed: records.iter().map(|m| u64::from(m.commands_executed)).sum(),
        total_commands_timed_out: records
            .iter()
            .map(|m| u64::from(m.commands_timed_out))
            .sum(),
        total_estimated_cost_usd: total_cost,
        avg_cost_per_instance_usd: total_cost / count,
        exit_reasons,
    })
}
