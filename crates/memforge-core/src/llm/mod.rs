//! LLM boundary: prompt in, structured tool calls out.

mod anthropic;
mod client;
mod scripted;

pub use anthropic::AnthropicClient;
pub use client::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, Role, TokenUsage,
    ToolCall, ToolSchema,
};
pub use scripted::{ScriptStep, ScriptedLlm};
