//! Contract tests for MemoryStore and AuditLog.
//!
//! Every check runs against both the in-memory fake and SurrealDB (`mem://`).
//! Any conforming implementation must pass these.

use chrono::{Duration, Utc};
use memforge_state::{
    AuditEntry, AuditLog, AuditOperation, ChangeSet, InMemoryStore, Memory, MemoryKind,
    MemoryStore, OwnerSettings, StorageError, Store, SurrealMemoryStore,
};

async fn backends() -> Vec<(&'static str, Box<dyn Store>)> {
    vec![
        ("memory", Box::new(InMemoryStore::new()) as Box<dyn Store>),
        (
            "surreal",
            Box::new(SurrealMemoryStore::in_memory().await.unwrap()) as Box<dyn Store>,
        ),
    ]
}

fn at(minutes: i64) -> chrono::DateTime<Utc> {
    Utc::now() - Duration::hours(1) + Duration::minutes(minutes)
}

// ===========================================================================
// MemoryStore
// ===========================================================================

#[tokio::test]
async fn list_memories_is_oldest_first_and_kind_filtered() {
    for (name, store) in backends().await {
        store
            .insert_memory(Memory::core("o", "second").with_id("b").with_created_at(at(2)))
            .await
            .unwrap();
        store
            .insert_memory(Memory::core("o", "first").with_id("a").with_created_at(at(1)))
            .await
            .unwrap();
        store
            .insert_memory(Memory::journal("o", "note").with_id("j").with_created_at(at(0)))
            .await
            .unwrap();
        store
            .insert_memory(Memory::core("other", "not mine").with_id("x"))
            .await
            .unwrap();

        let all = store.list_memories("o", None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["j", "a", "b"], "backend {name}");

        let core = store.list_memories("o", Some(MemoryKind::Core)).await.unwrap();
        let ids: Vec<&str> = core.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"], "backend {name}");
    }
}

#[tokio::test]
async fn insert_duplicate_id_fails() {
    for (name, store) in backends().await {
        store
            .insert_memory(Memory::core("o", "one").with_id("m1"))
            .await
            .unwrap();
        let err = store
            .insert_memory(Memory::core("o", "two").with_id("m1"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::DuplicateMemory { .. }),
            "backend {name}: {err:?}"
        );
    }
}

#[tokio::test]
async fn core_mass_ignores_journal() {
    for (name, store) in backends().await {
        store
            .insert_memory(Memory::core("o", "a").with_mass(40))
            .await
            .unwrap();
        store
            .insert_memory(Memory::core("o", "b").with_mass(60))
            .await
            .unwrap();
        store
            .insert_memory(Memory::journal("o", "c").with_mass(500))
            .await
            .unwrap();
        assert_eq!(store.core_mass("o").await.unwrap(), 100, "backend {name}");
        assert_eq!(store.core_mass("nobody").await.unwrap(), 0, "backend {name}");
    }
}

#[tokio::test]
async fn list_owners_is_sorted_and_distinct() {
    for (name, store) in backends().await {
        for owner in ["carol", "alice", "carol", "bob"] {
            store.insert_memory(Memory::core(owner, "x")).await.unwrap();
        }
        assert_eq!(
            store.list_owners().await.unwrap(),
            vec!["alice", "bob", "carol"],
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn owner_settings_round_trip_and_replace() {
    for (name, store) in backends().await {
        assert!(store.owner_settings("o").await.unwrap().is_none());

        store
            .put_owner_settings(OwnerSettings::new("o").with_retention_threshold(0.5))
            .await
            .unwrap();
        store
            .put_owner_settings(OwnerSettings::new("o").with_style_prompt("terse"))
            .await
            .unwrap();

        let settings = store.owner_settings("o").await.unwrap().unwrap();
        assert_eq!(settings.retention_threshold, None, "backend {name}");
        assert_eq!(settings.effective_style(), Some("terse"), "backend {name}");
    }
}

// ===========================================================================
// ChangeSet commit
// ===========================================================================

#[tokio::test]
async fn commit_applies_writes_and_audit_together() {
    for (name, store) in backends().await {
        let original = Memory::core("o", "likes tea").with_id("m1");
        store.insert_memory(original.clone()).await.unwrap();

        let mut updated = original.clone();
        updated.content = "likes green tea".to_string();

        let changes = ChangeSet::new("o")
            .replace(updated.clone())
            .audit(
                AuditEntry::new("s1", "o", 0, AuditOperation::Update)
                    .with_subject(&original)
                    .with_before("likes tea")
                    .with_after("likes green tea"),
            );
        store.commit(changes).await.unwrap();

        let stored = store.get_memory("o", "m1").await.unwrap().unwrap();
        assert_eq!(stored.content, "likes green tea", "backend {name}");

        let entries = store.session_entries("s1").await.unwrap();
        assert_eq!(entries.len(), 1, "backend {name}");
        assert_eq!(entries[0].subject.as_ref(), Some(&original), "backend {name}");
    }
}

#[tokio::test]
async fn commit_is_all_or_nothing() {
    for (name, store) in backends().await {
        store
            .insert_memory(Memory::core("o", "keep").with_id("keep"))
            .await
            .unwrap();

        let changes = ChangeSet::new("o")
            .insert(Memory::core("o", "merged").with_id("merged"))
            .delete("keep")
            .delete("missing")
            .audit(AuditEntry::new("s1", "o", 0, AuditOperation::ConsolidateCreate));
        let err = store.commit(changes).await.unwrap_err();
        assert!(
            matches!(err, StorageError::MemoryNotFound { .. }),
            "backend {name}: {err:?}"
        );

        assert!(store.get_memory("o", "keep").await.unwrap().is_some());
        assert!(store.get_memory("o", "merged").await.unwrap().is_none());
        assert!(store.session_entries("s1").await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn commit_rejects_foreign_memory() {
    for (name, store) in backends().await {
        store
            .insert_memory(Memory::core("alice", "hers").with_id("m1"))
            .await
            .unwrap();

        let err = store
            .commit(ChangeSet::new("bob").delete("m1"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::OwnerMismatch { .. }),
            "backend {name}: {err:?}"
        );
        assert!(store.get_memory("alice", "m1").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn commit_can_reinsert_deleted_snapshot() {
    for (name, store) in backends().await {
        let original = Memory::core("o", "restore me")
            .with_id("m1")
            .with_created_at(at(5));
        store.insert_memory(original.clone()).await.unwrap();

        store
            .commit(ChangeSet::new("o").delete("m1"))
            .await
            .unwrap();
        assert!(store.get_memory("o", "m1").await.unwrap().is_none());

        store
            .commit(ChangeSet::new("o").insert(original.clone()))
            .await
            .unwrap();
        let restored = store.get_memory("o", "m1").await.unwrap().unwrap();
        assert_eq!(restored.content, original.content, "backend {name}");
        assert_eq!(restored.mass, original.mass, "backend {name}");
        assert_eq!(
            restored.created_at.timestamp_millis(),
            original.created_at.timestamp_millis(),
            "backend {name}"
        );
    }
}

// ===========================================================================
// AuditLog
// ===========================================================================

#[tokio::test]
async fn session_entries_are_seq_ordered() {
    for (name, store) in backends().await {
        for seq in [2u64, 0, 1] {
            store
                .append(AuditEntry::new("s1", "o", seq, AuditOperation::Protect))
                .await
                .unwrap();
        }
        store
            .append(AuditEntry::new("s2", "o", 0, AuditOperation::Delete))
            .await
            .unwrap();

        let seqs: Vec<u64> = store
            .session_entries("s1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2], "backend {name}");
    }
}

#[tokio::test]
async fn owner_entries_newest_first_with_limit() {
    for (name, store) in backends().await {
        for seq in 0..5u64 {
            let mut entry = AuditEntry::new("s1", "o", seq, AuditOperation::Protect);
            entry.created_at = at(seq as i64);
            store.append(entry).await.unwrap();
        }

        let seqs: Vec<u64> = store
            .owner_entries("o", 3)
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![4, 3, 2], "backend {name}");
    }
}

#[tokio::test]
async fn last_session_outcome_skips_mutations() {
    for (name, store) in backends().await {
        assert!(store.last_session_outcome("o").await.unwrap().is_none());

        let mut completed = AuditEntry::new("s1", "o", 1, AuditOperation::SessionCompleted);
        completed.created_at = at(1);
        store.append(completed).await.unwrap();

        let mut rolled_back = AuditEntry::new("s2", "o", 3, AuditOperation::SessionRolledBack);
        rolled_back.created_at = at(2);
        store.append(rolled_back).await.unwrap();

        let mut mutation = AuditEntry::new("s3", "o", 0, AuditOperation::Delete);
        mutation.created_at = at(3);
        store.append(mutation).await.unwrap();

        let last = store.last_session_outcome("o").await.unwrap().unwrap();
        assert_eq!(last.session_id, "s2", "backend {name}");
        assert_eq!(last.operation, AuditOperation::SessionRolledBack);
    }
}
