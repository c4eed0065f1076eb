//! Scripted oracle for testing.
//!
//! Replays predetermined turns so the control loop can be driven end to end
//! without a real backend.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::conversation::TokenUsage;
use super::{Conversation, DecisionOracle, OracleError, OracleTurn, ToolCall};

/// A single scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum ScriptedReply {
    /// Return this turn.
    Turn(OracleTurn),
    /// Fail with a backend error carrying this message.
    Error(String),
    /// Fail as if the backend timed out.
    Timeout,
}

/// Oracle that replays [`ScriptedReply`] values in order.
///
/// Repeats the last reply once the script runs out and records every
/// conversation it was shown.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedOracle {
    replies: Arc<Vec<ScriptedReply>>,
    invocation_count: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Conversation>>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Arc::new(replies),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    /// Conversation as it was on the most recent call.
    pub fn last_conversation(&self) -> Option<Conversation> {
        self.seen.lock().unwrap().last().cloned()
    }
}

/// A turn requesting one command.
pub(crate) fn run_command(id: &str, command: &str, timeout: Option<i64>) -> ToolCall {
    let input = match timeout {
        Some(t) => json!({"command": command, "timeout": t}),
        None => json!({"command": command}),
    };
    ToolCall::new(id, "execute_command", input)
}

pub(crate) fn submit(id: &str) -> ToolCall {
    ToolCall::new(id, "submit_patch", json!({"reasoning": "done"}))
}

pub(crate) fn give_up(id: &str) -> ToolCall {
    ToolCall::new(id, "give_up", json!({"reason": "stuck"}))
}

/// Wraps calls in a turn with the given token usage.
pub(crate) fn turn(calls: Vec<ToolCall>, input_tokens: u64, output_tokens: u64) -> ScriptedReply {
    ScriptedReply::Turn(OracleTurn {
        text: String::new(),
        calls,
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
        cost_usd: None,
        steps: Default::default(),
    })
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn next_action(&self, conversation: &Conversation) -> Result<OracleTurn, OracleError> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(conversation.clone());

        let index = count.min(self.replies.len().saturating_sub(1));
        match self.replies.get(index) {
            Some(ScriptedReply::Turn(turn)) => Ok(turn.clone()),
            Some(ScriptedReply::Error(message)) => Err(OracleError::backend(message.clone())),
            Some(ScriptedReply::Timeout) => Err(OracleError::Timeout { seconds: 60 }),
            None => Ok(OracleTurn::answer("")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_oracle_replays_then_repeats_last() {
        let oracle = ScriptedOracle::new(vec![
            turn(vec![run_command("c1", "ls", None)], 10, 5),
            turn(vec![submit("c2")], 10, 5),
        ]);
        let conversation = Conversation::new(None, "psf/requests", "Fix it");

        let first = oracle.next_action(&conversation).await.unwrap();
        let second = oracle.next_action(&conversation).await.unwrap();
        let third = oracle.next_action(&conversation).await.unwrap();

        assert_eq!(first.calls[0].name, "execute_command");
        assert_eq!(second.calls[0].name, "submit_patch");
        assert_eq!(third.calls[0].name, "submit_patch");
        assert_eq!(oracle.invocation_count(), 3);
        assert!(oracle.last_conversation().is_some());
    }

    #[tokio::test]
    async fn test_scripted_oracle_errors() {
        let oracle = ScriptedOracle::new(vec![ScriptedReply::Timeout]);
        let conversation = Conversation::new(None, "psf/requests", "Fix it");
        let err = oracle.next_action(&conversation).await.unwrap_err();
        assert!(err.is_timeout());

        let oracle = ScriptedOracle::new(vec![ScriptedReply::Error("boom".to_string())]);
        let err = oracle.next_action(&conversation).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
