//! memforge-core: bounded autonomous memory compaction
//!
//! An LLM refines an owner's long-term memories through a small tool surface
//! while the engine enforces hard limits around it.
//!
//! ## Key Components
//!
//! - `actions` / `ActionDispatcher`: the `memory` tool and its handlers
//! - `CircuitBreaker`: retention check after every counted mutation
//! - `RollbackEngine`: all-or-nothing reversal from the audit trail
//! - `SessionController`: owner selection and the model/tool loop
//! - `Scheduler`: concurrent sessions with one-session-per-owner exclusion
//! - `llm`: provider boundary (`AnthropicClient`, `ScriptedLlm`)

pub mod actions;
pub mod audit;
pub mod breaker;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod obs;
pub mod prompt;
pub mod rollback;
pub mod scheduler;
pub mod session;
pub mod telemetry;

pub use actions::{tool_schema, MemoryAction, ACTION_NAMES, TOOL_NAME};
pub use audit::AuditTrail;
pub use breaker::{evaluate, BreakerVerdict, CircuitBreaker};
pub use config::{
    EngineConfig, RetryPolicy, DEFAULT_RETENTION_THRESHOLD, MAX_MUTATIONS_PER_SESSION,
};
pub use controller::{Eligibility, SessionController, SessionReport, TerminalState};
pub use dispatcher::{ActionDispatcher, ActionOutcome, SEARCH_LIMIT};
pub use error::{ActionError, EngineError, LlmError, Result};
pub use llm::{AnthropicClient, LlmClient, ScriptStep, ScriptedLlm};
pub use metrics::{MetricsSnapshot, METRICS};
pub use rollback::{RollbackEngine, RollbackReport};
pub use scheduler::{OwnerClaim, PassReport, Scheduler};
pub use session::{Session, SessionStats, TerminationReason};
pub use telemetry::init_tracing;
