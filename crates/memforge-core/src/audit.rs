//! Session-scoped view of the append-only audit log.
//!
//! Entries are stamped with the session's owner and the next sequence number
//! here, so every writer shares one ordering.

use std::sync::Arc;

use memforge_state::{AuditEntry, AuditOperation, StorageResult, Store};
use serde_json::Value;
use tracing::debug;

use crate::session::Session;

#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn Store>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// New applied entry for this session, not yet written.
    pub fn entry(session: &mut Session, operation: AuditOperation) -> AuditEntry {
        let seq = session.next_seq();
        AuditEntry::new(&session.session_id, &session.owner_id, seq, operation)
    }

    /// Record a mutation attempt that changed nothing.
    pub async fn record_rejected(
        &self,
        session: &mut Session,
        operation: AuditOperation,
        memory_id: Option<&str>,
        error: &str,
    ) -> StorageResult<()> {
        let mut entry = Self::entry(session, operation).rejected(error);
        if let Some(id) = memory_id {
            entry = entry.with_memory_id(id);
        }
        debug!(operation = %operation, seq = entry.seq, "recording rejected attempt");
        self.store.append(entry).await
    }

    /// Record a session outcome that has no accompanying memory write.
    pub async fn record_outcome(
        &self,
        session: &mut Session,
        operation: AuditOperation,
        detail: Value,
    ) -> StorageResult<()> {
        let entry = Self::entry(session, operation).with_detail(detail);
        self.store.append(entry).await
    }

    /// Every entry of a session in sequence order.
    pub async fn session_entries(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>> {
        self.store.session_entries(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memforge_state::{AuditOutcome, InMemoryStore};

    #[tokio::test]
    async fn test_rejected_entries_share_session_ordering() {
        let store = Arc::new(InMemoryStore::new());
        let trail = AuditTrail::new(store.clone());
        let mut session = Session::new("o", 100, 0.7, 10);

        let first = AuditTrail::entry(&mut session, AuditOperation::Delete);
        assert_eq!(first.seq, 0);

        trail
            .record_rejected(&mut session, AuditOperation::Delete, Some("m1"), "protected")
            .await
            .unwrap();

        let entries = trail.session_entries(&session.session_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
        assert_eq!(entries[0].memory_id.as_deref(), Some("m1"));
        assert_eq!(entries[0].detail["error"], "protected");
    }
}
