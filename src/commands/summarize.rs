//! Summarize a results log.
//!
//! Formatting is pure; IO happens only in `run`.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use crate::metrics::{aggregate, MetricsSummary};
use crate::results::ResultLog;

/// Formats a run summary for the terminal.
pub(crate) fn format_summary(summary: Option<&MetricsSummary>) -> String {
    let mut out = String::new();
    let Some(s) = summary else {
        let _ = writeln!(&mut out, "\n{} No results to summarize.", "ℹ".blue());
        return out;
    };

    let _ = writeln!(&mut out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "{}", "   Run Summary".yellow().bold());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(
        &mut out,
        "  Instances:  {}",
        s.num_instances.to_string().cyan()
    );
    let _ = writeln!(
        &mut out,
        "  Patches:    {} ({:.1}%)",
        s.patches_produced.to_string().green(),
        s.patch_rate * 100.0
    );
    let _ = writeln!(
        &mut out,
        "  Iterations: {} total, {:.1} avg",
        s.total_iterations,
        s.avg_iterations
    );
    let _ = writeln!(
        &mut out,
        "  Tokens:     {} total, {:.0} avg",
        s.total_tokens,
        s.avg_tokens_per_instance
    );
    let _ = writeln!(
        &mut out,
        "  Commands:   {} run, {} timed out",
        s.total_commands_executed,
        s.total_commands_timed_out
    );
    let _ = writeln!(
        &mut out,
        "  Time:       {:.1}s total, {:.1}s avg",
        s.total_wall_clock_seconds,
        s.avg_wall_clock_seconds
    );
    let _ = writeln!(
        &mut out,
        "  Cost:       ${:.4} total, ${:.4} avg",
        s.total_estimated_cost_usd,
        s.avg_cost_per_instance_usd
    );

    let _ = writeln!(&mut out, "\n  Exit reasons:");
    for (reason, count) in &s.exit_reasons {
        let _ = writeln!(&mut out, "    {:<16} {}", reason, count.to_string().cyan());
    }
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());

    out
}

/// Entry point: summarizes `<dir>/results.jsonl`.
pub(crate) fn run(dir: &Path) -> Result<()> {
    let records = ResultLog::new(dir).load()?;
    let metrics: Vec<_> = records.into_iter().map(|r| r.metrics).collect();
    print!("{}", format_summary(aggregate(&metrics).as_ref()));
    Ok(())
}
