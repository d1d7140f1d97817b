//! Executes memory actions on behalf of the model.
//!
//! Every successful write commits its memory change and audit entries as one
//! [`ChangeSet`]. Every rejected write attempt leaves one `rejected` audit
//! entry. Storage failures are returned as [`ActionError::Storage`] and abort
//! the session instead of going back to the model.

use std::sync::Arc;

use chrono::Utc;
use memforge_state::{
    estimate_mass, AuditOperation, ChangeSet, Memory, MemoryKind, StorageResult, Store,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::actions::{audit_operation_for, raw_action_name, MemoryAction};
use crate::audit::AuditTrail;
use crate::error::ActionError;
use crate::llm::ToolCall;
use crate::metrics::METRICS;
use crate::session::{Session, TerminationReason};

/// Upper bound on search hits returned to the model.
pub const SEARCH_LIMIT: usize = 25;

/// Result of a successfully executed action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: &'static str,
    /// Counted toward the mutation cap (and therefore breaker-checked)
    pub counted: bool,
    /// JSON handed back to the model
    pub payload: Value,
}

impl ActionOutcome {
    fn new(action: &'static str, counted: bool, payload: Value) -> Self {
        Self {
            action,
            counted,
            payload,
        }
    }
}

#[derive(Clone)]
pub struct ActionDispatcher {
    store: Arc<dyn Store>,
    audit: AuditTrail,
}

impl ActionDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            audit: AuditTrail::new(store.clone()),
            store,
        }
    }

    /// Parse and execute one tool call.
    pub async fn execute(
        &self,
        session: &mut Session,
        call: &ToolCall,
    ) -> Result<ActionOutcome, ActionError> {
        match MemoryAction::from_tool_call(call) {
            Ok(action) => self.dispatch(session, action).await,
            Err(err) => {
                let operation = audit_operation_for(raw_action_name(call));
                let target = call.arguments.get("id").and_then(Value::as_str);
                self.reject(session, operation, target, err).await
            }
        }
    }

    pub async fn dispatch(
        &self,
        session: &mut Session,
        action: MemoryAction,
    ) -> Result<ActionOutcome, ActionError> {
        if let Some(reason) = session.termination() {
            let err = ActionError::AlreadyTerminal {
                reason: reason.to_string(),
            };
            return self
                .reject(session, action.audit_operation(), action.primary_target(), err)
                .await;
        }

        if action.is_mutating() && session.cap_reached() {
            let err = ActionError::CapExceeded {
                max: session.max_mutations,
            };
            return self
                .reject(session, action.audit_operation(), action.primary_target(), err)
                .await;
        }

        let result = match &action {
            MemoryAction::Search { query } => self.search(session, query).await,
            MemoryAction::Consolidate { ids, content } => {
                self.consolidate(session, ids, content).await
            }
            MemoryAction::Update { id, content } => self.update(session, id, content).await,
            MemoryAction::Delete { ids } => self.delete(session, ids).await,
            MemoryAction::Protect { id } => self.protect(session, id).await,
            MemoryAction::Complete { summary } => self.complete(session, summary).await,
        };

        match result {
            Ok(outcome) => {
                if outcome.counted {
                    METRICS.inc_mutations();
                }
                Ok(outcome)
            }
            Err(err) if err.is_infrastructure() => Err(err),
            Err(err) => {
                self.reject(session, action.audit_operation(), action.primary_target(), err)
                    .await
            }
        }
    }

    async fn reject(
        &self,
        session: &mut Session,
        operation: Option<AuditOperation>,
        target: Option<&str>,
        err: ActionError,
    ) -> Result<ActionOutcome, ActionError> {
        debug!(kind = err.kind(), error = %err, "action rejected");
        if let Some(operation) = operation {
            self.audit
                .record_rejected(session, operation, target, &err.to_string())
                .await?;
        }
        METRICS.inc_rejected();
        Err(err)
    }

    /// Only core memories are addressable; journals are invisible to actions.
    async fn fetch_target(&self, session: &Session, id: &str) -> Result<Memory, ActionError> {
        self.store
            .get_memory(&session.owner_id, id)
            .await?
            .filter(|m| m.kind == MemoryKind::Core)
            .ok_or_else(|| ActionError::NotFound {
                memory_id: id.to_string(),
            })
    }

    /// Resolve every id, failing on the first missing or protected one.
    async fn fetch_unprotected(
        &self,
        session: &Session,
        ids: &[String],
        attempted: &str,
    ) -> Result<Vec<Memory>, ActionError> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let memory = self.fetch_target(session, id).await?;
            if memory.protected {
                return Err(ActionError::Protected {
                    memory_id: memory.id,
                    attempted: attempted.to_string(),
                });
            }
            targets.push(memory);
        }
        Ok(targets)
    }

    async fn search(&self, session: &Session, query: &str) -> Result<ActionOutcome, ActionError> {
        let needle = query.to_lowercase();
        let hits: Vec<Value> = self
            .store
            .list_memories(&session.owner_id, Some(MemoryKind::Core))
            .await?
            .iter()
            .filter(|m| !m.protected && m.content.to_lowercase().contains(&needle))
            .take(SEARCH_LIMIT)
            .map(memory_json)
            .collect();

        Ok(ActionOutcome::new(
            "search",
            false,
            json!({ "ok": true, "count": hits.len(), "memories": hits }),
        ))
    }

    async fn consolidate(
        &self,
        session: &mut Session,
        ids: &[String],
        content: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let sources = self.fetch_unprotected(session, ids, "consolidated").await?;

        let created_at = sources
            .iter()
            .map(|m| m.created_at)
            .min()
            .unwrap_or_else(Utc::now);
        let merged = Memory::core(&session.owner_id, content).with_created_at(created_at);

        let mut changes = ChangeSet::new(&session.owner_id).insert(merged.clone()).audit(
            AuditTrail::entry(session, AuditOperation::ConsolidateCreate)
                .with_subject(&merged)
                .with_after(&merged.content)
                .with_detail(json!({ "sources": ids })),
        );
        for source in &sources {
            changes = changes.delete(&source.id).audit(
                AuditTrail::entry(session, AuditOperation::ConsolidateDelete)
                    .with_subject(source)
                    .with_before(&source.content)
                    .with_detail(json!({ "merged_into": merged.id })),
            );
        }
        self.store.commit(changes).await?;

        session.record_mutation();
        session.stats.consolidated += 1;
        info!(merged_id = %merged.id, sources = sources.len(), "consolidated memories");

        Ok(ActionOutcome::new(
            "consolidate",
            true,
            json!({
                "ok": true,
                "memory": memory_json(&merged),
                "removed": ids,
                "mutations_remaining": session.mutations_remaining(),
            }),
        ))
    }

    async fn update(
        &self,
        session: &mut Session,
        id: &str,
        content: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let current = self.fetch_target(session, id).await?;
        if current.protected {
            return Err(ActionError::Protected {
                memory_id: current.id,
                attempted: "updated".to_string(),
            });
        }

        let mut updated = current.clone();
        updated.content = content.to_string();
        updated.mass = estimate_mass(content);

        let changes = ChangeSet::new(&session.owner_id)
            .replace(updated.clone())
            .audit(
                AuditTrail::entry(session, AuditOperation::Update)
                    .with_subject(&current)
                    .with_before(&current.content)
                    .with_after(&updated.content)
                    .with_detail(json!({ "mass_before": current.mass, "mass_after": updated.mass })),
            );
        self.store.commit(changes).await?;

        session.record_mutation();
        session.stats.updated += 1;

        Ok(ActionOutcome::new(
            "update",
            true,
            json!({
                "ok": true,
                "memory": memory_json(&updated),
                "mutations_remaining": session.mutations_remaining(),
            }),
        ))
    }

    async fn delete(
        &self,
        session: &mut Session,
        ids: &[String],
    ) -> Result<ActionOutcome, ActionError> {
        let targets = self.fetch_unprotected(session, ids, "deleted").await?;

        let mut changes = ChangeSet::new(&session.owner_id);
        for target in &targets {
            changes = changes.delete(&target.id).audit(
                AuditTrail::entry(session, AuditOperation::Delete)
                    .with_subject(target)
                    .with_before(&target.content),
            );
        }
        self.store.commit(changes).await?;

        // A batch counts once per call.
        session.record_mutation();
        session.stats.deleted += targets.len() as u32;

        Ok(ActionOutcome::new(
            "delete",
            true,
            json!({
                "ok": true,
                "deleted": ids,
                "mutations_remaining": session.mutations_remaining(),
            }),
        ))
    }

    async fn protect(&self, session: &mut Session, id: &str) -> Result<ActionOutcome, ActionError> {
        let current = self.fetch_target(session, id).await?;
        if current.protected {
            return Ok(ActionOutcome::new(
                "protect",
                false,
                json!({ "ok": true, "id": id, "changed": false }),
            ));
        }

        let protected = current.clone().with_protected(true);
        let changes = ChangeSet::new(&session.owner_id)
            .replace(protected)
            .audit(AuditTrail::entry(session, AuditOperation::Protect).with_subject(&current));
        self.store.commit(changes).await?;
        session.stats.protected += 1;

        Ok(ActionOutcome::new(
            "protect",
            false,
            json!({ "ok": true, "id": id, "changed": true }),
        ))
    }

    async fn complete(
        &self,
        session: &mut Session,
        summary: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let post_mass = self
            .finish(session, TerminationReason::Completed, summary)
            .await?;
        Ok(ActionOutcome::new(
            "complete",
            false,
            json!({ "ok": true, "post_mass": post_mass }),
        ))
    }

    /// Close a session successfully: one summary audit entry plus one journal
    /// memory, committed together. Returns the post-session core mass.
    pub async fn finish(
        &self,
        session: &mut Session,
        reason: TerminationReason,
        summary: &str,
    ) -> StorageResult<u64> {
        let post_mass = self.store.core_mass(&session.owner_id).await?;
        let journal = Memory::journal(
            &session.owner_id,
            completion_journal(session, summary, post_mass),
        );

        let entry = AuditTrail::entry(session, AuditOperation::SessionCompleted)
            .with_memory_id(&journal.id)
            .with_after(summary)
            .with_detail(json!({
                "reason": reason,
                "summary": summary,
                "pre_mass": session.pre_session_mass,
                "post_mass": post_mass,
                "mutations": session.mutation_count,
                "stats": session.stats,
            }));

        self.store
            .commit(ChangeSet::new(&session.owner_id).insert(journal).audit(entry))
            .await?;
        session.terminate(reason, Some(summary.to_string()));
        Ok(post_mass)
    }
}

fn memory_json(memory: &Memory) -> Value {
    json!({
        "id": memory.id,
        "content": memory.content,
        "mass": memory.mass,
        "protected": memory.protected,
        "created_at": memory.created_at.to_rfc3339(),
    })
}

fn completion_journal(session: &Session, summary: &str, post_mass: u64) -> String {
    let summary = if summary.trim().is_empty() {
        "no summary given"
    } else {
        summary.trim()
    };
    format!(
        "Memory refinement session complete. {summary} ({} change(s); core mass went from {} to {}.)",
        session.mutation_count, session.pre_session_mass, post_mass
    )
}
