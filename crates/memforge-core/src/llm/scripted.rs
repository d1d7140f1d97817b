//! Deterministic LLM client driven by scripted steps.
//!
//! Used by tests and dry runs. Each `complete` call pops the next step; the
//! requests it received are kept for inspection.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::client::{CompletionRequest, CompletionResponse, LlmClient, ToolCall};
use crate::error::LlmError;

/// One scripted reply.
#[derive(Debug)]
pub enum ScriptStep {
    Respond(CompletionResponse),
    Fail(LlmError),
}

impl ScriptStep {
    /// Reply with tool calls, each given as `(action, arguments)` on the memory tool.
    pub fn actions(calls: Vec<(&str, Value)>) -> Self {
        let tool_calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (action, mut args))| {
                if let Value::Object(map) = &mut args {
                    map.insert("action".to_string(), Value::String(action.to_string()));
                }
                ToolCall::new(format!("call_{i}"), crate::actions::TOOL_NAME, args)
            })
            .collect();
        ScriptStep::Respond(CompletionResponse::with_tool_calls(tool_calls))
    }

    /// Single action reply.
    pub fn action(action: &str, args: Value) -> Self {
        Self::actions(vec![(action, args)])
    }

    /// Text-only reply (ends the loop).
    pub fn text(content: impl Into<String>) -> Self {
        ScriptStep::Respond(CompletionResponse::text(content))
    }

    pub fn fail(error: LlmError) -> Self {
        ScriptStep::Fail(error)
    }

    /// Retryable transport failure.
    pub fn transient() -> Self {
        ScriptStep::Fail(LlmError::Transport {
            provider: "scripted".to_string(),
            message: "connection reset".to_string(),
        })
    }
}

#[derive(Clone, Default)]
pub struct ScriptedLlm {
    model: String,
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedLlm {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            model: "scripted".to_string(),
            script: Arc::new(Mutex::new(VecDeque::from(steps))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn push(&self, step: ScriptStep) {
        self.script.lock().await.push_back(step);
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }

    /// Requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().await.push(request);
        match self.script.lock().await.pop_front() {
            Some(ScriptStep::Respond(response)) => Ok(response),
            Some(ScriptStep::Fail(error)) => Err(error),
            None => Err(LlmError::ScriptExhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::Message;
    use serde_json::json;

    #[tokio::test]
    async fn test_steps_are_served_in_order() {
        let llm = ScriptedLlm::new(vec![
            ScriptStep::action("search", json!({"query": "tea"})),
            ScriptStep::text("done"),
        ]);

        let first = llm
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.tool_calls[0].arguments["action"], "search");

        let second = llm
            .complete(CompletionRequest::new(vec![]))
            .await
            .unwrap();
        assert_eq!(second.content.as_deref(), Some("done"));

        let err = llm.complete(CompletionRequest::new(vec![])).await.unwrap_err();
        assert!(matches!(err, LlmError::ScriptExhausted));
        assert_eq!(llm.requests().await.len(), 3);
    }
}
