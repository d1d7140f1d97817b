//! In-memory implementation of the storage traits
//!
//! `InMemoryStore` satisfies the `MemoryStore` and `AuditLog` contracts without
//! external dependencies. A single mutex guards memories and audit entries
//! together so a `ChangeSet` is validated and applied under one lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{AuditEntry, Memory, MemoryKind, OwnerSettings};
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct StoreState {
    memories: HashMap<String, Memory>,
    audit: Vec<AuditEntry>,
    settings: HashMap<String, OwnerSettings>,
}

/// In-memory store backed by `HashMap`s under one `Mutex`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
    }

    /// Total number of audit entries (all owners).
    pub fn audit_len(&self) -> usize {
        self.lock().map(|s| s.audit.len()).unwrap_or(0)
    }
}

fn sort_by_creation(memories: &mut [Memory]) {
    memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert_memory(&self, memory: Memory) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state.memories.contains_key(&memory.id) {
            return Err(StorageError::DuplicateMemory {
                memory_id: memory.id,
            });
        }
        state.memories.insert(memory.id.clone(), memory);
        Ok(())
    }

    async fn get_memory(&self, owner_id: &str, memory_id: &str) -> StorageResult<Option<Memory>> {
        let state = self.lock()?;
        Ok(state
            .memories
            .get(memory_id)
            .filter(|m| m.owner_id == owner_id)
            .cloned())
    }

    async fn list_memories(
        &self,
        owner_id: &str,
        kind: Option<MemoryKind>,
    ) -> StorageResult<Vec<Memory>> {
        let state = self.lock()?;
        let mut memories: Vec<Memory> = state
            .memories
            .values()
            .filter(|m| m.owner_id == owner_id)
            .filter(|m| kind.map(|k| m.kind == k).unwrap_or(true))
            .cloned()
            .collect();
        sort_by_creation(&mut memories);
        Ok(memories)
    }

    async fn list_owners(&self) -> StorageResult<Vec<String>> {
        let state = self.lock()?;
        let mut owners: Vec<String> = state
            .memories
            .values()
            .map(|m| m.owner_id.clone())
            .collect();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    async fn owner_settings(&self, owner_id: &str) -> StorageResult<Option<OwnerSettings>> {
        let state = self.lock()?;
        Ok(state.settings.get(owner_id).cloned())
    }

    async fn put_owner_settings(&self, settings: OwnerSettings) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.settings.insert(settings.owner_id.clone(), settings);
        Ok(())
    }

    async fn commit(&self, changes: ChangeSet) -> StorageResult<()> {
        let mut state = self.lock()?;

        changes.validate(|id| state.memories.get(id).map(|m| m.owner_id.clone()))?;

        for write in changes.writes {
            match write {
                MemoryWrite::Insert(memory) | MemoryWrite::Replace(memory) => {
                    state.memories.insert(memory.id.clone(), memory);
                }
                MemoryWrite::Delete { memory_id } => {
                    state.memories.remove(&memory_id);
                }
            }
        }
        state.audit.extend(changes.audit);
        Ok(())
    }
}

#[async_trait]
impl AuditLog for InMemoryStore {
    async fn append(&self, entry: AuditEntry) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.audit.push(entry);
        Ok(())
    }

    async fn session_entries(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>> {
        let state = self.lock()?;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    async fn owner_entries(&self, owner_id: &str, limit: usize) -> StorageResult<Vec<AuditEntry>> {
        let state = self.lock()?;
        // Insertion order is chronological; walk it backwards for newest first.
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| e.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_session_outcome(&self, owner_id: &str) -> StorageResult<Option<AuditEntry>> {
        let state = self.lock()?;
        Ok(state
            .audit
            .iter()
            .rev()
            .find(|e| e.owner_id == owner_id && e.operation.is_session_outcome())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AuditOperation;

    #[tokio::test]
    async fn test_failed_commit_leaves_state_untouched() {
        let store = InMemoryStore::new();
        let keep = Memory::core("o", "keep me").with_id("keep");
        store.insert_memory(keep.clone()).await.unwrap();

        // Second write targets a missing id, so the first must not land either.
        let changes = ChangeSet::new("o")
            .delete("keep")
            .delete("missing")
            .audit(AuditEntry::new("s", "o", 0, AuditOperation::Delete));
        let err = store.commit(changes).await.unwrap_err();
        assert!(matches!(err, StorageError::MemoryNotFound { .. }));

        assert_eq!(store.get_memory("o", "keep").await.unwrap(), Some(keep));
        assert_eq!(store.audit_len(), 0);
    }

    #[tokio::test]
    async fn test_get_memory_is_owner_scoped() {
        let store = InMemoryStore::new();
        store
            .insert_memory(Memory::core("alice", "secret").with_id("m1"))
            .await
            .unwrap();
        assert!(store.get_memory("bob", "m1").await.unwrap().is_none());
        assert!(store.get_memory("alice", "m1").await.unwrap().is_some());
    }
}
