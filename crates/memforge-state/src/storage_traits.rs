//! Storage trait definitions for memforge
//!
//! These traits define the persistence boundary:
//! - `MemoryStore`: owner-scoped memory queries plus transactional writes
//! - `AuditLog`: append-only audit records and their queries
//!
//! All traits are async and backend-agnostic. An in-memory implementation is
//! provided in the `fakes` module; `SurrealMemoryStore` is the durable one.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{AuditEntry, Memory, MemoryKind, OwnerSettings};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ChangeSet: one atomic unit of memory writes plus their audit entries
// ---------------------------------------------------------------------------

/// A single memory write inside a [`ChangeSet`]
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryWrite {
    /// Create a memory; fails if the id already exists
    Insert(Memory),
    /// Overwrite an existing memory record in full
    Replace(Memory),
    /// Hard-delete a memory
    Delete { memory_id: String },
}

impl MemoryWrite {
    pub fn memory_id(&self) -> &str {
        match self {
            MemoryWrite::Insert(m) | MemoryWrite::Replace(m) => &m.id,
            MemoryWrite::Delete { memory_id } => memory_id,
        }
    }
}

/// Memory writes and audit entries that commit together or not at all.
///
/// Writes are applied in order, so a change set may delete a memory and
/// re-insert it, or insert one and delete another, within one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub owner_id: String,
    pub writes: Vec<MemoryWrite>,
    pub audit: Vec<AuditEntry>,
}

impl ChangeSet {
    pub fn new(owner_id: impl Into<String>) -> Self {
        ChangeSet {
            owner_id: owner_id.into(),
            writes: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn insert(mut self, memory: Memory) -> Self {
        self.writes.push(MemoryWrite::Insert(memory));
        self
    }

    pub fn replace(mut self, memory: Memory) -> Self {
        self.writes.push(MemoryWrite::Replace(memory));
        self
    }

    pub fn delete(mut self, memory_id: impl Into<String>) -> Self {
        self.writes.push(MemoryWrite::Delete {
            memory_id: memory_id.into(),
        });
        self
    }

    pub fn audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.audit.is_empty()
    }

    /// Ids touched by the writes, in order, without duplicates
    pub fn touched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for write in &self.writes {
            let id = write.memory_id();
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    /// Check every write against the current state before anything is applied.
    ///
    /// `owner_of` returns the owner of a currently stored memory id, or `None`
    /// when the id does not exist. Writes are simulated in order.
    pub fn validate<F>(&self, owner_of: F) -> StorageResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut overlay: HashMap<&str, Option<&str>> = HashMap::new();

        for write in &self.writes {
            let id = write.memory_id();
            let current: Option<String> = match overlay.get(id) {
                Some(state) => state.map(str::to_string),
                None => owner_of(id),
            };

            match write {
                MemoryWrite::Insert(memory) => {
                    self.check_record_owner(memory)?;
                    if current.is_some() {
                        return Err(StorageError::DuplicateMemory {
                            memory_id: id.to_string(),
                        });
                    }
                    overlay.insert(id, Some(self.owner_id.as_str()));
                }
                MemoryWrite::Replace(memory) => {
                    self.check_record_owner(memory)?;
                    self.check_existing(id, current)?;
                }
                MemoryWrite::Delete { .. } => {
                    self.check_existing(id, current)?;
                    overlay.insert(id, None);
                }
            }
        }

        for entry in &self.audit {
            if entry.owner_id != self.owner_id {
                return Err(StorageError::OwnerMismatch {
                    expected: self.owner_id.clone(),
                    actual: entry.owner_id.clone(),
                    memory_id: entry.memory_id.clone().unwrap_or_default(),
                });
            }
        }

        Ok(())
    }

    fn check_record_owner(&self, memory: &Memory) -> StorageResult<()> {
        if memory.owner_id != self.owner_id {
            return Err(StorageError::OwnerMismatch {
                expected: self.owner_id.clone(),
                actual: memory.owner_id.clone(),
                memory_id: memory.id.clone(),
            });
        }
        Ok(())
    }

    fn check_existing(&self, id: &str, current: Option<String>) -> StorageResult<()> {
        match current {
            None => Err(StorageError::MemoryNotFound {
                owner_id: self.owner_id.clone(),
                memory_id: id.to_string(),
            }),
            Some(owner) if owner != self.owner_id => Err(StorageError::OwnerMismatch {
                expected: self.owner_id.clone(),
                actual: owner,
                memory_id: id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore: owner-scoped memory persistence
// ---------------------------------------------------------------------------

/// Owner-scoped memory persistence.
///
/// Guarantees:
/// - `list_memories` returns entries ordered by `created_at` (then id).
/// - `commit` applies every write and audit entry of a [`ChangeSet`], or none.
/// - Reads observe only committed state.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a memory outside of any session (capture flows, imports).
    async fn insert_memory(&self, memory: Memory) -> StorageResult<()>;

    /// Fetch one memory; `None` if it does not exist for this owner.
    async fn get_memory(&self, owner_id: &str, memory_id: &str) -> StorageResult<Option<Memory>>;

    /// List an owner's memories, optionally filtered by kind, oldest first.
    async fn list_memories(
        &self,
        owner_id: &str,
        kind: Option<MemoryKind>,
    ) -> StorageResult<Vec<Memory>>;

    /// Sum of mass over the owner's core memories.
    async fn core_mass(&self, owner_id: &str) -> StorageResult<u64> {
        let core = self.list_memories(owner_id, Some(MemoryKind::Core)).await?;
        Ok(core.iter().map(|m| m.mass).sum())
    }

    /// All owners that hold at least one memory, sorted.
    async fn list_owners(&self) -> StorageResult<Vec<String>>;

    /// Per-owner overrides, if any were stored.
    async fn owner_settings(&self, owner_id: &str) -> StorageResult<Option<OwnerSettings>>;

    /// Create or replace the owner's overrides.
    async fn put_owner_settings(&self, settings: OwnerSettings) -> StorageResult<()>;

    /// Atomically apply a change set (memory writes plus audit entries).
    async fn commit(&self, changes: ChangeSet) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// AuditLog: append-only audit trail
// ---------------------------------------------------------------------------

/// Append-only audit log.
///
/// Entries are never mutated or deleted.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one entry on its own (rejections, session outcomes).
    async fn append(&self, entry: AuditEntry) -> StorageResult<()>;

    /// All entries of a session ordered by `seq` ascending.
    async fn session_entries(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>>;

    /// Most recent entries for an owner, newest first.
    async fn owner_entries(&self, owner_id: &str, limit: usize) -> StorageResult<Vec<AuditEntry>>;

    /// The newest session-outcome entry for an owner.
    async fn last_session_outcome(&self, owner_id: &str) -> StorageResult<Option<AuditEntry>>;
}

/// Everything the engine needs from a backend.
pub trait Store: MemoryStore + AuditLog {}

impl<T: MemoryStore + AuditLog + ?Sized> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Memory;

    fn owners(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(id, owner)| (id.to_string(), owner.to_string()))
            .collect();
        move |id| map.get(id).cloned()
    }

    #[test]
    fn test_insert_of_existing_id_is_duplicate() {
        let set = ChangeSet::new("o").insert(Memory::core("o", "x").with_id("m1"));
        let err = set.validate(owners(&[("m1", "o")])).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateMemory { memory_id } if memory_id == "m1"));
    }

    #[test]
    fn test_delete_then_reinsert_is_valid() {
        let set = ChangeSet::new("o")
            .delete("m1")
            .insert(Memory::core("o", "x").with_id("m1"));
        assert!(set.validate(owners(&[("m1", "o")])).is_ok());
    }

    #[test]
    fn test_double_delete_fails() {
        let set = ChangeSet::new("o").delete("m1").delete("m1");
        let err = set.validate(owners(&[("m1", "o")])).unwrap_err();
        assert!(matches!(err, StorageError::MemoryNotFound { .. }));
    }

    #[test]
    fn test_foreign_memory_is_rejected() {
        let set = ChangeSet::new("o").delete("m1");
        let err = set.validate(owners(&[("m1", "someone-else")])).unwrap_err();
        assert!(matches!(err, StorageError::OwnerMismatch { .. }));
    }

    #[test]
    fn test_touched_ids_dedupes_in_order() {
        let set = ChangeSet::new("o")
            .delete("b")
            .insert(Memory::core("o", "x").with_id("a"))
            .delete("a");
        assert_eq!(set.touched_ids(), vec!["b".to_string(), "a".to_string()]);
    }
}
