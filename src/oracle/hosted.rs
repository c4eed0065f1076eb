//! Hosted chat oracle over the Anthropic Messages API.
//!
//! Each call sends the whole conversation with the three tool definitions
//! and maps `tool_use` blocks in the reply to actions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::conversation::{
    Conversation, OracleTurn, TokenUsage, ToolCall, Turn, TOOL_EXECUTE_COMMAND, TOOL_GIVE_UP,
    TOOL_SUBMIT_PATCH,
};
use super::{DecisionOracle, OracleError};
use crate::config::HostedConfig;
use crate::templates;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Oracle backed by a hosted chat completion API.
pub(crate) struct HostedChatOracle {
    client: reqwest::Client,
    config: HostedConfig,
    api_key: String,
}

impl HostedChatOracle {
    pub fn new(config: HostedConfig, api_key: String) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OracleError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Reads the API key from the configured environment variable.
    pub fn from_env(config: HostedConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                OracleError::missing_dependency(format!(
                    "{} is not set; the hosted backend needs an API key",
                    config.api_key_env
                ))
            })?;
        Self::new(config, api_key)
    }

    async fn send_once(&self, body: &Value) -> Result<OracleTurn, OracleError> {
        let endpoint = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                // A slow request is a transport failure: retried, then an
                // error. Only the wall-clock budget ends a run as a timeout.
                if e.is_timeout() {
                    OracleError::transport(format!(
                        "request timed out after {}s: {e}",
                        self.config.request_timeout_secs
                    ))
                } else {
                    OracleError::transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OracleError::transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, text));
        }
        parse_response(&text, &self.config)
    }
}

#[async_trait]
impl DecisionOracle for HostedChatOracle {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn next_action(&self, conversation: &Conversation) -> Result<OracleTurn, OracleError> {
        let body = build_request(&self.config, conversation);
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 0;

        loop {
            match self.send_once(&body).await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Hosted oracle request failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                result => return result,
            }
        }
    }
}

/// Tool schema advertised to the model.
fn tool_definitions() -> Value {
    json!([
        {
            "name": TOOL_EXECUTE_COMMAND,
            "description": "Run a shell command in the task environment. Returns the combined output and the exit code.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to run"
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Timeout in seconds (default 120, max 600)"
                    }
                },
                "required": ["command"]
            }
        },
        {
            "name": TOOL_SUBMIT_PATCH,
            "description": "Submit your fix. The current changes are captured as a git diff.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "reasoning": {
                        "type": "string",
                        "description": "Short explanation of the fix"
                    }
                },
                "required": ["reasoning"]
            }
        },
        {
            "name": TOOL_GIVE_UP,
            "description": "Stop working on the task. Partial changes are still captured.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the task cannot be completed"
                    }
                },
                "required": ["reason"]
            }
        }
    ])
}

fn message_for(turn: &Turn) -> Value {
    match turn {
        Turn::User { text } => json!({"role": "user", "content": text}),
        Turn::Assistant { text, calls } => {
            let mut content = Vec::new();
            if !text.is_empty() {
                content.push(json!({"type": "text", "text": text}));
            }
            for call in calls {
                content.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            json!({"role": "assistant", "content": content})
        }
        Turn::ToolResults { results } => {
            let content: Vec<Value> = results
                .iter()
                .map(|result| {
                    json!({
                        "type": "tool_result",
                        "tool_use_id": result.call_id,
                        "content": result.content,
                        "is_error": result.is_error,
                    })
                })
                .collect();
            json!({"role": "user", "content": content})
        }
    }
}

pub(crate) fn build_request(config: &HostedConfig, conversation: &Conversation) -> Value {
    let workdir = conversation
        .environment
        .as_ref()
        .map_or("/testbed", |env| env.workdir.as_str());
    let messages: Vec<Value> = conversation.turns().iter().map(message_for).collect();

    json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "system": templates::system_prompt(&conversation.repo, workdir),
        "tools": tool_definitions(),
        "messages": messages,
    })
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ResponseUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub(crate) fn parse_response(body: &str, config: &HostedConfig) -> Result<OracleTurn, OracleError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| OracleError::malformed(e.to_string()))?;

    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall::new(id, name, input)),
            ContentBlock::Other => {}
        }
    }

    let usage = TokenUsage {
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
    };
    debug!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        tool_calls = calls.len(),
        "Hosted oracle responded"
    );

    Ok(OracleTurn {
        text: texts.join("\n"),
        calls,
        usage,
        cost_usd: Some(estimate_cost(
            usage,
            config.input_price_per_mtok,
            config.output_price_per_mtok,
        )),
        steps: Default::default(),
    })
}

/// Cost in USD from per-million-token prices.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn estimate_cost(usage: TokenUsage, input_price: f64, output_price: f64) -> f64 {
    (usage.input_tokens as f64 * input_price + usage.output_tokens as f64 * output_price)
        / 1_000_000.0
}

fn classify_status(status: u16, body: String) -> OracleError {
    match status {
        401 | 403 => OracleError::auth(body),
        429 => OracleError::rate_limited(body),
        _ => OracleError::Api { status, body },
    }
}
