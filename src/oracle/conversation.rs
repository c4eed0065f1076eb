//! Conversation state shared between the control loop and oracles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sandbox::EnvironmentInfo;

/// Tool names understood by the control loop.
pub(crate) const TOOL_EXECUTE_COMMAND: &str = "execute_command";
pub(crate) const TOOL_SUBMIT_PATCH: &str = "submit_patch";
pub(crate) const TOOL_GIVE_UP: &str = "give_up";

/// One thing the oracle asked the loop to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    RunCommand {
        command: String,
        timeout: Option<i64>,
    },
    Submit {
        reasoning: String,
    },
    GiveUp {
        reason: String,
    },
    Unrecognized {
        name: String,
    },
}

impl Action {
    /// Builds an action from a tool name and its JSON arguments.
    ///
    /// Missing string arguments become empty strings; an unknown tool name
    /// becomes [`Action::Unrecognized`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_tool_call(name: &str, input: &Value) -> Self {
        let text = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match name {
            TOOL_EXECUTE_COMMAND => Self::RunCommand {
                command: text("command"),
                timeout: input
                    .get("timeout")
                    .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64))),
            },
            TOOL_SUBMIT_PATCH => Self::Submit {
                reasoning: text("reasoning"),
            },
            TOOL_GIVE_UP => Self::GiveUp {
                reason: text("reason"),
            },
            other => Self::Unrecognized {
                name: other.to_string(),
            },
        }
    }
}

/// A tool call as the oracle emitted it, with its parsed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub action: Action,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        let name = name.into();
        let action = Action::from_tool_call(&name, &input);
        Self {
            id: id.into(),
            name,
            input,
            action,
        }
    }
}

/// Result of one tool call, fed back to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User { text: String },
    Assistant { text: String, calls: Vec<ToolCall> },
    ToolResults { results: Vec<ToolResult> },
}

/// Append-only record of the exchange for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Sandbox description, for oracles that drive it themselves.
    pub environment: Option<EnvironmentInfo>,
    /// Repository the task is about, e.g. `django/django`.
    pub repo: String,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(
        environment: Option<EnvironmentInfo>,
        repo: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            repo: repo.into(),
            turns: vec![Turn::User {
                text: prompt.into(),
            }],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Text of the first user turn: the task prompt.
    pub fn task_prompt(&self) -> Option<&str> {
        self.turns.iter().find_map(|turn| match turn {
            Turn::User { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Token counts for one oracle call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Counters reported by delegated backends that run their own loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedSteps {
    pub turns: Option<u64>,
    pub reasoning_steps: Option<u64>,
    pub execution_steps: Option<u64>,
}

/// Everything an oracle returns for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleTurn {
    /// Free-form assistant text.
    pub text: String,
    /// Requested actions; empty means a plain answer.
    pub calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// Cost of this call, if the backend reports or prices it.
    pub cost_usd: Option<f64>,
    pub steps: DelegatedSteps,
}

impl OracleTurn {
    /// A plain answer with no actions.
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_command_action() {
        let action = Action::from_tool_call(
            "execute_command",
            &json!({"command": "pytest -x", "timeout": 300}),
        );
        assert_eq!(
            action,
            Action::RunCommand {
                command: "pytest -x".to_string(),
                timeout: Some(300)
            }
        );
    }

    #[test]
    fn test_execute_command_defaults() {
        let action = Action::from_tool_call("execute_command", &json!({}));
        assert_eq!(
            action,
            Action::RunCommand {
                command: String::new(),
                timeout: None
            }
        );

        let fractional = Action::from_tool_call(
            "execute_command",
            &json!({"command": "ls", "timeout": 12.7}),
        );
        assert!(matches!(
            fractional,
            Action::RunCommand {
                timeout: Some(12),
                ..
            }
        ));
    }

    #[test]
    fn test_submit_and_give_up_actions() {
        assert_eq!(
            Action::from_tool_call("submit_patch", &json!({"reasoning": "fixed sign"})),
            Action::Submit {
                reasoning: "fixed sign".to_string()
            }
        );
        assert_eq!(
            Action::from_tool_call("give_up", &json!({"reason": "cannot reproduce"})),
            Action::GiveUp {
                reason: "cannot reproduce".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_tool_is_unrecognized() {
        let call = ToolCall::new("toolu_1", "browse_web", json!({"url": "x"}));
        assert_eq!(
            call.action,
            Action::Unrecognized {
                name: "browse_web".to_string()
            }
        );
    }

    #[test]
    fn test_conversation_starts_with_prompt() {
        let mut conversation = Conversation::new(None, "psf/requests", "Fix the bug");
        conversation.push(Turn::Assistant {
            text: "Looking".to_string(),
            calls: vec![],
        });
        assert_eq!(conversation.turns().len(), 2);
        assert_eq!(conversation.task_prompt(), Some("Fix the bug"));
    }
}
