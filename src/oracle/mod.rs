//! Decision oracles.
//!
//! An oracle looks at the conversation so far and returns either a plain
//! answer or a list of tool calls. It never touches the sandbox; the control
//! loop executes whatever it asks for.
//!
//! - `hosted`: Anthropic Messages API with tool calling
//! - `claude-cli` / `codex-cli`: delegated agent CLIs that run their own loop
//! - `noop`: answers immediately
//!
//! The backend is selected via `[agent].backend` in fixloop.toml.

mod cli;
mod conversation;
mod env;
mod error;
mod hosted;
#[cfg(test)]
pub(crate) mod mock;
mod noop;
mod registry;

pub(crate) use conversation::{Action, Conversation, OracleTurn, ToolCall, ToolResult, Turn};
pub(crate) use error::OracleError;
pub(crate) use registry::{resolve_backend, Backend, Registry};

use async_trait::async_trait;

/// A backend that decides the next step of a task.
#[async_trait]
pub(crate) trait DecisionOracle: Send + Sync {
    /// Backend name for logs and records.
    fn name(&self) -> &'static str;

    /// Returns the next answer or actions for `conversation`.
    async fn next_action(&self, conversation: &Conversation) -> Result<OracleTurn, OracleError>;
}
