//! Anthropic Messages API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Role, TokenUsage, ToolCall,
};
use crate::config::DEFAULT_MODEL;
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// A missing or blank key is a setup problem, never worth a retry.
fn require_api_key(value: Option<String>) -> Result<String, LlmError> {
    match value {
        Some(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(LlmError::Config {
            provider: PROVIDER.to_string(),
            message: format!("{API_KEY_VAR} not set"),
        }),
    }
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout_secs: u64,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        let timeout_secs = 60;
        Ok(Self {
            client: build_http_client(timeout_secs)?,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs,
        })
    }

    /// Reads ANTHROPIC_API_KEY.
    pub fn from_env() -> Result<Self, LlmError> {
        Self::new(require_api_key(std::env::var(API_KEY_VAR).ok())?)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different host (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Read timeout for the whole request.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Result<Self, LlmError> {
        self.client = build_http_client(timeout_secs)?;
        self.timeout_secs = timeout_secs;
        Ok(self)
    }

    fn map_send_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout {
                provider: PROVIDER.to_string(),
                timeout_secs: self.timeout_secs,
            }
        } else {
            LlmError::Transport {
                provider: PROVIDER.to_string(),
                message: err.to_string(),
            }
        }
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client, LlmError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| LlmError::Transport {
            provider: PROVIDER.to_string(),
            message: format!("failed to build http client: {e}"),
        })
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn to_wire_messages(request: &CompletionRequest) -> (Option<String>, Vec<AnthropicMessage>) {
    let system = request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone());

    let mut messages: Vec<AnthropicMessage> = Vec::new();
    for m in request.messages.iter().filter(|m| m.role != Role::System) {
        let message = match m.role {
            Role::Tool => AnthropicMessage {
                role: "user",
                content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: m.content.clone(),
                }]),
            },
            Role::Assistant => match &m.tool_calls {
                Some(calls) => {
                    let mut blocks = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: m.content.clone(),
                        });
                    }
                    blocks.extend(calls.iter().map(|tc| ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments.clone(),
                    }));
                    AnthropicMessage {
                        role: "assistant",
                        content: AnthropicContent::Blocks(blocks),
                    }
                }
                None => AnthropicMessage {
                    role: "assistant",
                    content: AnthropicContent::Text(m.content.clone()),
                },
            },
            Role::User | Role::System => AnthropicMessage {
                role: "user",
                content: AnthropicContent::Text(m.content.clone()),
            },
        };

        // Consecutive tool results must share one user turn.
        if m.role == Role::Tool {
            if let Some(AnthropicMessage {
                role: "user",
                content: AnthropicContent::Blocks(prev),
            }) = messages.last_mut()
            {
                if let AnthropicContent::Blocks(blocks) = message.content {
                    prev.extend(blocks);
                    continue;
                }
            }
        }
        messages.push(message);
    }

    (system, messages)
}

async fn response_to_error(response: Response) -> LlmError {
    let status = response.status().as_u16();
    let retry_after_secs = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    let message = if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated]", &body[..cut])
    } else {
        body
    };

    LlmError::Http {
        provider: PROVIDER.to_string(),
        status,
        message,
        retry_after_secs,
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, messages) = to_wire_messages(&request);

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.parameters.clone(),
                    })
                    .collect(),
            )
        };

        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(4096),
            system,
            messages,
            tools,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(response_to_error(response).await);
        }

        let data: AnthropicResponse = response.json().await.map_err(|e| LlmError::Decode {
            provider: PROVIDER.to_string(),
            message: e.to_string(),
        })?;

        let mut content: Option<String> = None;
        let mut tool_calls = vec![];

        for block in data.content {
            match block.r#type.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        content = Some(match content {
                            Some(prev) => format!("{prev}\n{text}"),
                            None => text,
                        });
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name), Some(input)) = (block.id, block.name, block.input)
                    {
                        tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: input,
                        });
                    }
                }
                _ => {}
            }
        }

        let finish_reason = match data.stop_reason.as_deref() {
            Some("tool_use") => FinishReason::ToolCalls,
            Some("max_tokens") => FinishReason::MaxTokens,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            tool_calls,
            finish_reason,
            usage: data.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::Message;
    use serde_json::json;

    #[test]
    fn test_consecutive_tool_results_share_one_turn() {
        let request = CompletionRequest::new(vec![
            Message::system("rules"),
            Message::user("ledger"),
            Message::assistant_with_tool_calls(
                None,
                vec![
                    ToolCall::new("a", "memory", json!({"action": "search"})),
                    ToolCall::new("b", "memory", json!({"action": "protect"})),
                ],
            ),
            Message::tool_result("a", "{}"),
            Message::tool_result("b", "{}"),
        ]);

        let (system, messages) = to_wire_messages(&request);
        assert_eq!(system.as_deref(), Some("rules"));
        assert_eq!(messages.len(), 3);

        let last = serde_json::to_value(&messages[2].content).unwrap();
        assert_eq!(last.as_array().unwrap().len(), 2);
        assert_eq!(last[0]["type"], "tool_result");
        assert_eq!(last[1]["tool_use_id"], "b");
    }

    #[test]
    fn test_missing_api_key_is_not_retryable() {
        for value in [None, Some(String::new()), Some("  ".to_string())] {
            let err = require_api_key(value).unwrap_err();
            assert!(matches!(err, LlmError::Config { .. }));
            assert!(!err.is_retryable());
            assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
        }
        assert_eq!(require_api_key(Some("sk-test".to_string())).unwrap(), "sk-test");
    }
}
