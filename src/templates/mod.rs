//! Embedded prompt templates.
//!
//! Placeholders are `{name}` and are filled with plain string replacement.

/// System prompt for oracles that act through the tool schema.
pub(crate) const SYSTEM_PROMPT: &str = include_str!("system_prompt.md");

/// First user turn of every task.
pub(crate) const TASK_PROMPT: &str = include_str!("task_prompt.md");

/// System prompt for delegated CLI agents driving a container with `docker exec`.
pub(crate) const DELEGATED_PROMPT: &str = include_str!("delegated_prompt.md");

pub(crate) fn system_prompt(repo: &str, workdir: &str) -> String {
    SYSTEM_PROMPT
        .replace("{repo}", repo)
        .replace("{workdir}", workdir)
}

pub(crate) fn task_prompt(problem_statement: &str) -> String {
    TASK_PROMPT.replace("{problem_statement}", problem_statement.trim())
}

pub(crate) fn delegated_prompt(repo: &str, container: &str, workdir: &str) -> String {
    DELEGATED_PROMPT
        .replace("{repo}", repo)
        .replace("{container}", container)
        .replace("{workdir}", workdir)
}
