//! Resumable result log and per-task artifacts.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::agent::AgentResult;
use crate::metrics::{aggregate, AgentMetrics};

pub(crate) const RESULTS_FILE: &str = "results.jsonl";
const PATCH_FILE: &str = "patch.diff";
const METRICS_FILE: &str = "metrics.json";
const SUMMARY_FILE: &str = "summary.json";

/// Rejects ids that could escape the output directory.
pub(crate) fn validate_path_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("{kind} must not be empty");
    }
    if value.contains("..") || value.contains('/') || value.contains('\\') {
        anyhow::bail!("Invalid {kind} '{value}': must not contain '..', '/' or '\\'");
    }
    Ok(())
}

/// Append-only JSON Lines log of finished attempts.
pub(crate) struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(RESULTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Task ids that already have a record. Malformed lines are skipped.
    pub fn completed_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|record| record.task_id)
            .collect())
    }

    /// Every readable record, in file order.
    pub fn load(&self) -> Result<Vec<AgentResult>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let mut records = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentResult>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    line = i + 1,
                    "Skipping malformed record in {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }

    pub fn append(&self, record: &AgentResult) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let line = serde_json::to_string(record).context("Failed to serialize result")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// `<output_dir>/logs/<run_id>`.
pub(crate) fn run_dir(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join("logs").join(run_id)
}

/// Writes `patch.diff` (when there is one) and `metrics.json` for a task.
pub(crate) fn write_task_artifacts(run_dir: &Path, record: &AgentResult) -> Result<()> {
    validate_path_component("task id", &record.task_id)?;
    let task_dir = run_dir.join(&record.task_id);
    fs::create_dir_all(&task_dir)
        .with_context(|| format!("Failed to create directory: {}", task_dir.display()))?;

    if let Some(patch) = &record.patch {
        let path = task_dir.join(PATCH_FILE);
        fs::write(&path, format!("{patch}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    record.metrics.save(&task_dir.join(METRICS_FILE))
}

/// Writes the aggregate summary; `{}` when there were no attempts.
pub(crate) fn write_summary(run_dir: &Path, metrics: &[AgentMetrics]) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("Failed to create directory: {}", run_dir.display()))?;
    let path = run_dir.join(SUMMARY_FILE);
    let content = match aggregate(metrics) {
        Some(summary) => serde_json::to_string_pretty(&summary)?,
        None => "{}".to_string(),
    };
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ExitReason;
    use tempfile::TempDir;

    fn record(task_id: &str, patch: Option<&str>) -> AgentResult {
        let mut metrics = AgentMetrics::new(task_id, "noop");
        metrics.start_timer();
        metrics.finalize(patch, ExitReason::Completed);
        AgentResult {
            task_id: task_id.to_string(),
            backend: "noop".to_string(),
            patch: patch.map(str::to_string),
            exit_reason: ExitReason::Completed,
            metrics,
        }
    }

    #[test]
    fn test_validate_path_component() {
        assert!(validate_path_component("task id", "django__django-11099").is_ok());
        assert!(validate_path_component("run id", "2024-06-01.baseline").is_ok());
        for bad in ["", "..", "a/../b", "a/b", "a\\b", "..hidden"] {
            assert!(validate_path_component("task id", bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_missing_log_has_no_completed_ids() {
        let dir = TempDir::new().unwrap();
        let log = ResultLog::new(dir.path());
        assert!(log.completed_ids().unwrap().is_empty());
    }

    #[test]
    fn test_append_then_skip_completed() {
        let dir = TempDir::new().unwrap();
        let log = ResultLog::new(&dir.path().join("out"));
        log.append(&record("a", Some("diff"))).unwrap();
        log.append(&record("b", None)).unwrap();

        let ids = log.completed_ids().unwrap();
        assert!(ids.contains("a"));
        assert!(ids.contains("b"));
        assert!(!ids.contains("c"));

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["exit_reason"], "completed");
        assert_eq!(first["patch"], "diff");
        assert_eq!(first["metrics"]["task_id"], "a");
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let dir = TempDir::new().unwrap();
        let log = ResultLog::new(dir.path());
        log.append(&record("a", None)).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{\"task_id\": \"trunc").unwrap();
        writeln!(file).unwrap();
        drop(file);
        log.append(&record("b", None)).unwrap();

        let ids = log.completed_ids().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_task_artifacts() {
        let dir = TempDir::new().unwrap();
        let run = run_dir(dir.path(), "r1");

        write_task_artifacts(&run, &record("with-patch", Some("diff --git a/x b/x\n"))).unwrap();
        write_task_artifacts(&run, &record("no-patch", None)).unwrap();

        assert!(run.join("with-patch").join("patch.diff").exists());
        assert!(run.join("with-patch").join("metrics.json").exists());
        assert!(!run.join("no-patch").join("patch.diff").exists());
        assert!(run.join("no-patch").join("metrics.json").exists());
    }

    #[test]
    fn test_task_artifacts_reject_traversal() {
        let dir = TempDir::new().unwrap();
        let run = run_dir(dir.path(), "r1");
        assert!(write_task_artifacts(&run, &record("../escape", None)).is_err());
        assert!(!dir.path().join("logs").join("escape").exists());
    }

    #[test]
    fn test_summary_empty_and_populated() {
        let dir = TempDir::new().unwrap();
        let run = run_dir(dir.path(), "r1");

        let path = write_summary(&run, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");

        let metrics = vec![record("a", Some("diff")).metrics, record("b", None).metrics];
        write_summary(&run, &metrics).unwrap();
        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(summary["num_instances"], 2);
        assert_eq!(summary["patches_produced"], 1);
        assert_eq!(summary["exit_reasons"]["completed"], 2);
    }
}
