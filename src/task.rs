//! Task definitions and the task file loader.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One bug to fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Task {
    #[serde(alias = "instance_id")]
    pub task_id: String,
    /// Repository name, e.g. `django/django`.
    pub repo: String,
    pub problem_statement: String,
    /// Image override for the docker runtime.
    #[serde(default)]
    pub image: Option<String>,
    /// Working directory override (container path or host directory).
    #[serde(default)]
    pub workdir: Option<String>,
}

/// Loads tasks from a JSON array or a JSON Lines file.
pub(crate) fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;

    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task file: {}", path.display()));
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("Failed to parse task on line {} of {}", i + 1, path.display())
            })
        })
        .collect()
}
