//! Unwinds every applied mutation of a session in one transaction.
//!
//! Reversal reads only the session's audit entries: each applied mutation
//! entry carries the snapshot needed to invert it. Inverses are applied in
//! descending `seq` order. If the inverse change set cannot be built or
//! committed, nothing is applied, a `rollback_failed` entry is written and the
//! caller gets [`EngineError::RollbackFailed`].

use std::sync::Arc;

use memforge_state::{AuditEntry, AuditOperation, ChangeSet, Memory, Store};
use serde_json::json;
use tracing::{error, info};

use crate::audit::AuditTrail;
use crate::error::{EngineError, Result};
use crate::obs;
use crate::session::{Session, SessionStats, TerminationReason};

/// Outcome of a successful rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub reversed: usize,
    pub pre_mass: u64,
    pub attempted_post_mass: u64,
    pub percent_change: f64,
    pub journal_id: Option<String>,
}

#[derive(Clone)]
pub struct RollbackEngine {
    store: Arc<dyn Store>,
    audit: AuditTrail,
}

impl RollbackEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            audit: AuditTrail::new(store.clone()),
            store,
        }
    }

    /// Restore the owner's memories to their exact pre-session state.
    ///
    /// `reason` is `CircuitBreaker` for a breaker trip (writes a journal
    /// memory) or `Interrupted` when an infrastructure error cut the loop short.
    pub async fn rollback_session(
        &self,
        session: &mut Session,
        reason: TerminationReason,
    ) -> Result<RollbackReport> {
        let attempted_post_mass = self.store.core_mass(&session.owner_id).await?;
        let entries = self.audit.session_entries(&session.session_id).await?;

        let mut reversible: Vec<AuditEntry> =
            entries.into_iter().filter(AuditEntry::is_reversible).collect();
        reversible.sort_by(|a, b| b.seq.cmp(&a.seq));
        let reversed = reversible.len();

        let percent_change = percent_change(session.pre_session_mass, attempted_post_mass);
        let mut report = RollbackReport {
            reversed,
            pre_mass: session.pre_session_mass,
            attempted_post_mass,
            percent_change,
            journal_id: None,
        };

        if reversed == 0 && reason != TerminationReason::CircuitBreaker {
            session.terminate(reason, None);
            return Ok(report);
        }

        let mut changes = match inverse_changes(&session.owner_id, &reversible) {
            Ok(changes) => changes,
            Err(why) => return Err(self.escalate(session, why).await),
        };

        let summary = AuditTrail::entry(session, AuditOperation::SessionRolledBack).with_detail(
            json!({
                "reason": reason,
                "pre_mass": session.pre_session_mass,
                "attempted_post_mass": attempted_post_mass,
                "percent_change": percent_change,
                "reversed": reversed,
                "counts": session.stats,
            }),
        );

        if reason == TerminationReason::CircuitBreaker {
            let journal = Memory::journal(
                &session.owner_id,
                rollback_journal(session, attempted_post_mass, percent_change),
            );
            report.journal_id = Some(journal.id.clone());
            changes = changes.insert(journal);
        }
        changes = changes.audit(summary);

        if let Err(err) = self.store.commit(changes).await {
            return Err(self.escalate(session, err.to_string()).await);
        }

        session.terminate(reason, None);
        obs::emit_rollback_finished(&session.session_id, reversed, reason.as_str());
        info!(
            session_id = %session.session_id,
            reversed,
            pre_mass = session.pre_session_mass,
            attempted_post_mass,
            "session rolled back"
        );
        Ok(report)
    }

    async fn escalate(&self, session: &mut Session, why: String) -> EngineError {
        error!(
            session_id = %session.session_id,
            owner_id = %session.owner_id,
            reason = %why,
            "rollback failed; manual intervention required"
        );
        if let Err(err) = self
            .audit
            .record_outcome(
                session,
                AuditOperation::RollbackFailed,
                json!({ "error": why, "pre_mass": session.pre_session_mass }),
            )
            .await
        {
            error!(session_id = %session.session_id, error = %err, "could not record rollback failure");
        }
        session.terminate(TerminationReason::Interrupted, None);
        EngineError::RollbackFailed {
            session_id: session.session_id.clone(),
            reason: why,
        }
    }
}

/// Build the inverse of `entries`, which must already be in descending seq order.
fn inverse_changes(
    owner_id: &str,
    entries: &[AuditEntry],
) -> std::result::Result<ChangeSet, String> {
    let mut changes = ChangeSet::new(owner_id);
    for entry in entries {
        let snapshot = || {
            entry.subject.clone().ok_or_else(|| {
                format!(
                    "audit entry {} ({}) has no snapshot to restore",
                    entry.seq, entry.operation
                )
            })
        };
        changes = match entry.operation {
            AuditOperation::Delete | AuditOperation::ConsolidateDelete => {
                changes.insert(snapshot()?)
            }
            AuditOperation::Update | AuditOperation::Protect => changes.replace(snapshot()?),
            AuditOperation::ConsolidateCreate => {
                let id = entry
                    .memory_id
                    .clone()
                    .or_else(|| entry.subject.as_ref().map(|m| m.id.clone()))
                    .ok_or_else(|| {
                        format!("audit entry {} has no consolidated memory id", entry.seq)
                    })?;
                changes.delete(id)
            }
            other => return Err(format!("audit entry {} ({other}) is not reversible", entry.seq)),
        };
    }
    Ok(changes)
}

fn percent_change(pre_mass: u64, post_mass: u64) -> f64 {
    if pre_mass == 0 {
        return 0.0;
    }
    let change = (post_mass as f64 - pre_mass as f64) / pre_mass as f64 * 100.0;
    (change * 10.0).round() / 10.0
}

fn describe_counts(stats: &SessionStats) -> String {
    let parts: Vec<String> = [
        ("deleted", stats.deleted),
        ("consolidated", stats.consolidated),
        ("updated", stats.updated),
        ("protected", stats.protected),
    ]
    .iter()
    .filter(|(_, n)| *n > 0)
    .map(|(label, n)| format!("{label} {n}"))
    .collect();
    if parts.is_empty() {
        "no changes".to_string()
    } else {
        parts.join(", ")
    }
}

fn rollback_journal(session: &Session, attempted_post_mass: u64, percent_change: f64) -> String {
    format!(
        "A memory refinement session was rolled back. The attempted changes ({}) would have \
         reduced core memory from {} to {} ({:+.1}%), below the {:.0}% retention floor, so every \
         change was reverted and memories are exactly as they were before the session.",
        describe_counts(&session.stats),
        session.pre_session_mass,
        attempted_post_mass,
        percent_change,
        session.retention_threshold * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(200, 100), -50.0);
        assert_eq!(percent_change(150, 100), -33.3);
        assert_eq!(percent_change(0, 10), 0.0);
    }

    #[test]
    fn test_missing_snapshot_is_an_error() {
        let entry = AuditEntry::new("s", "o", 0, AuditOperation::Delete).with_memory_id("m1");
        let err = inverse_changes("o", &[entry]).unwrap_err();
        assert!(err.contains("no snapshot"));
    }

    #[test]
    fn test_inverse_of_consolidation() {
        let merged = Memory::core("o", "merged").with_id("new");
        let source = Memory::core("o", "old").with_id("old");
        let entries = vec![
            AuditEntry::new("s", "o", 1, AuditOperation::ConsolidateDelete).with_subject(&source),
            AuditEntry::new("s", "o", 0, AuditOperation::ConsolidateCreate).with_subject(&merged),
        ];
        let changes = inverse_changes("o", &entries).unwrap();
        assert_eq!(changes.touched_ids(), vec!["old".to_string(), "new".to_string()]);
    }

    #[test]
    fn test_describe_counts() {
        let stats = SessionStats {
            deleted: 2,
            ..SessionStats::default()
        };
        assert_eq!(describe_counts(&stats), "deleted 2");
        assert_eq!(describe_counts(&SessionStats::default()), "no changes");
    }
}
