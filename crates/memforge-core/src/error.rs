//! Error taxonomy for memforge-core.
//!
//! - [`ActionError`]: returned to the LLM as structured tool feedback; never fatal.
//! - [`LlmError`]: failures at the model boundary, some of them retryable.
//! - [`EngineError`]: job-level failures surfaced to the scheduler and CLI.

use memforge_state::StorageError;

/// Errors produced while dispatching a single memory action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action '{name}'; valid actions are: {valid}")]
    UnknownAction { name: String, valid: String },

    #[error("action '{action}' is missing required parameter '{param}'")]
    MissingParam { action: String, param: String },

    #[error("action '{action}' has invalid parameter '{param}': {reason}")]
    InvalidParam {
        action: String,
        param: String,
        reason: String,
    },

    #[error("memory not found: {memory_id}")]
    NotFound { memory_id: String },

    #[error("memory {memory_id} is protected and cannot be {attempted}")]
    Protected {
        memory_id: String,
        attempted: String,
    },

    #[error("mutation cap reached ({max} per session); only search, protect and complete remain available")]
    CapExceeded { max: u32 },

    #[error("session already terminal ({reason})")]
    AlreadyTerminal { reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ActionError {
    /// Stable machine-readable tag included in tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::UnknownAction { .. } => "unknown_action",
            ActionError::MissingParam { .. } => "missing_param",
            ActionError::InvalidParam { .. } => "invalid_param",
            ActionError::NotFound { .. } => "not_found",
            ActionError::Protected { .. } => "protected",
            ActionError::CapExceeded { .. } => "cap_exceeded",
            ActionError::AlreadyTerminal { .. } => "already_terminal",
            ActionError::Storage(_) => "storage",
        }
    }

    /// Bad or missing tool parameters.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ActionError::UnknownAction { .. }
                | ActionError::MissingParam { .. }
                | ActionError::InvalidParam { .. }
        )
    }

    /// Target is protected or does not exist for this owner.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            ActionError::NotFound { .. } | ActionError::Protected { .. }
        )
    }

    /// Infrastructure failure; aborts the session instead of going back to the LLM.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ActionError::Storage(_))
    }

    /// JSON payload handed back to the model as the tool result.
    pub fn to_tool_result(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Errors at the LLM boundary.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} returned HTTP {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("request to {provider} failed: {message}")]
    Transport { provider: String, message: String },

    #[error("request to {provider} timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("could not decode {provider} response: {message}")]
    Decode { provider: String, message: String },

    #[error("{provider} client misconfigured: {message}")]
    Config { provider: String, message: String },

    #[error("scripted client has no more responses")]
    ScriptExhausted,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            LlmError::Transport { .. } | LlmError::Timeout { .. } => true,
            LlmError::Decode { .. } | LlmError::Config { .. } | LlmError::ScriptExhausted => {
                false
            }
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LlmError::Http {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Job-level engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// Partial rollback is never acceptable; this needs an operator.
    #[error("rollback of session {session_id} failed, manual intervention required: {reason}")]
    RollbackFailed { session_id: String, reason: String },

    #[error("owner {0} already has a session in progress")]
    OwnerBusy(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Errors worth another attempt at the job level.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Llm(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::RollbackFailed { .. })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            EngineError::Llm(e) => e.retry_after_secs(),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_and_not_found_are_distinct() {
        let protected = ActionError::Protected {
            memory_id: "m1".to_string(),
            attempted: "deleted".to_string(),
        };
        let missing = ActionError::NotFound {
            memory_id: "m1".to_string(),
        };
        assert_ne!(protected.kind(), missing.kind());
        assert!(protected.is_authorization());
        assert!(missing.is_authorization());
        assert!(!protected.is_validation());
    }

    #[test]
    fn test_tool_result_carries_kind_and_message() {
        let err = ActionError::MissingParam {
            action: "update".to_string(),
            param: "content".to_string(),
        };
        let payload = err.to_tool_result();
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"], "missing_param");
        let message = payload["message"].as_str().unwrap();
        assert!(message.contains("update"));
        assert!(message.contains("content"));
    }

    #[test]
    fn test_llm_retryable_statuses() {
        let http = |status| LlmError::Http {
            provider: "test".to_string(),
            status,
            message: String::new(),
            retry_after_secs: None,
        };
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!LlmError::ScriptExhausted.is_retryable());
    }

    #[test]
    fn test_engine_error_transience() {
        let transient = EngineError::Llm(LlmError::Timeout {
            provider: "test".to_string(),
            timeout_secs: 30,
        });
        assert!(transient.is_transient());

        let misconfigured = EngineError::Llm(LlmError::Config {
            provider: "test".to_string(),
            message: "key not set".to_string(),
        });
        assert!(!misconfigured.is_transient());

        let fatal = EngineError::RollbackFailed {
            session_id: "s".to_string(),
            reason: "snapshot missing".to_string(),
        };
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transient());
    }
}
