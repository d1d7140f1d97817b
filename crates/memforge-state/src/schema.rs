//! Record definitions shared by every backend
//!
//! - `Memory`: one owner-scoped memory entry (core or journal)
//! - `AuditEntry`: one append-only audit record
//! - `OwnerSettings`: per-owner overrides for refinement sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on memory content, in characters.
pub const MAX_CONTENT_CHARS: usize = 8_000;

/// Token-estimate mass of a piece of content (roughly four characters per token).
pub fn estimate_mass(content: &str) -> u64 {
    let chars = content.chars().count() as u64;
    chars.div_ceil(4)
}

/// Durable core memories count toward the budget; journal memories do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Core,
    Journal,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Core => "core",
            MemoryKind::Journal => "journal",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single memory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    /// Stable identifier (UUID v4 unless imported with one)
    pub id: String,
    /// Owner this memory belongs to
    pub owner_id: String,
    /// Memory text
    pub content: String,
    /// Core or journal
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    /// Protected memories can never be deleted or consolidated away
    pub protected: bool,
    /// Token-estimate size
    pub mass: u64,
    /// Creation time; consolidation carries the earliest source timestamp
    pub created_at: DateTime<Utc>,
}

impl Memory {
    /// Create a memory with mass derived from its content
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>, kind: MemoryKind) -> Self {
        let content = content.into();
        Memory {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            mass: estimate_mass(&content),
            content,
            kind,
            protected: false,
            created_at: Utc::now(),
        }
    }

    pub fn core(owner_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(owner_id, content, MemoryKind::Core)
    }

    pub fn journal(owner_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(owner_id, content, MemoryKind::Journal)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the derived mass (imports and fixtures)
    pub fn with_mass(mut self, mass: u64) -> Self {
        self.mass = mass;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    pub fn is_core(&self) -> bool {
        self.kind == MemoryKind::Core
    }

    /// Short form of the id (first 8 chars) for ledgers and logs
    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }
}

/// What an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// Content of a memory was replaced
    Update,
    /// A memory was hard-deleted
    Delete,
    /// A memory was marked protected
    Protect,
    /// A consolidated memory was created from several sources
    ConsolidateCreate,
    /// A consolidation source was removed
    ConsolidateDelete,
    /// Session ended through `complete` or an implicit soft-complete
    SessionCompleted,
    /// Session mutations were unwound
    SessionRolledBack,
    /// Session could not reach a terminal state after retries
    SessionAbandoned,
    /// Rollback itself failed; manual intervention required
    RollbackFailed,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Update => "update",
            AuditOperation::Delete => "delete",
            AuditOperation::Protect => "protect",
            AuditOperation::ConsolidateCreate => "consolidate_create",
            AuditOperation::ConsolidateDelete => "consolidate_delete",
            AuditOperation::SessionCompleted => "session_completed",
            AuditOperation::SessionRolledBack => "session_rolled_back",
            AuditOperation::SessionAbandoned => "session_abandoned",
            AuditOperation::RollbackFailed => "rollback_failed",
        }
    }

    /// Operations that change memory state and therefore have an inverse
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            AuditOperation::Update
                | AuditOperation::Delete
                | AuditOperation::Protect
                | AuditOperation::ConsolidateCreate
                | AuditOperation::ConsolidateDelete
        )
    }

    /// Operations that close out a session
    pub fn is_session_outcome(&self) -> bool {
        matches!(
            self,
            AuditOperation::SessionCompleted
                | AuditOperation::SessionRolledBack
                | AuditOperation::SessionAbandoned
                | AuditOperation::RollbackFailed
        )
    }
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the recorded attempt changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Rejected,
}

/// Append-only audit record.
///
/// `subject` holds the full memory snapshot the entry is about: the pre-image
/// for update/delete/protect/consolidate-source entries and the post-image for
/// consolidate-create entries. Rollback reads nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub session_id: String,
    pub owner_id: String,
    /// Monotonic position within the session
    pub seq: u64,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub memory_id: Option<String>,
    pub before_content: Option<String>,
    pub after_content: Option<String>,
    pub subject: Option<Memory>,
    /// Free-form details: error text, session stats, mass figures
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        seq: u64,
        operation: AuditOperation,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            seq,
            operation,
            outcome: AuditOutcome::Applied,
            memory_id: None,
            before_content: None,
            after_content: None,
            subject: None,
            detail: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Attach the memory snapshot this entry describes
    pub fn with_subject(mut self, memory: &Memory) -> Self {
        self.memory_id = Some(memory.id.clone());
        self.subject = Some(memory.clone());
        self
    }

    pub fn with_memory_id(mut self, memory_id: impl Into<String>) -> Self {
        self.memory_id = Some(memory_id.into());
        self
    }

    pub fn with_before(mut self, content: impl Into<String>) -> Self {
        self.before_content = Some(content.into());
        self
    }

    pub fn with_after(mut self, content: impl Into<String>) -> Self {
        self.after_content = Some(content.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Mark as a rejected attempt carrying the error text
    pub fn rejected(mut self, error: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Rejected;
        self.detail = serde_json::json!({ "error": error.into() });
        self
    }

    pub fn is_applied(&self) -> bool {
        self.outcome == AuditOutcome::Applied
    }

    /// Applied mutation entries are the ones rollback must invert
    pub fn is_reversible(&self) -> bool {
        self.is_applied() && self.operation.is_mutation()
    }
}

/// Per-owner overrides for refinement sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerSettings {
    pub owner_id: String,
    /// Minimum fraction of pre-session mass that must survive
    pub retention_threshold: Option<f64>,
    /// Style instruction appended to the refinement prompt
    pub style_prompt: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OwnerSettings {
    pub fn new(owner_id: impl Into<String>) -> Self {
        OwnerSettings {
            owner_id: owner_id.into(),
            retention_threshold: None,
            style_prompt: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_retention_threshold(mut self, threshold: f64) -> Self {
        self.retention_threshold = Some(threshold);
        self
    }

    pub fn with_style_prompt(mut self, style: impl Into<String>) -> Self {
        self.style_prompt = Some(style.into());
        self
    }

    /// Style prompt if set and non-blank
    pub fn effective_style(&self) -> Option<&str> {
        self.style_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
