use memforge_state::{
    AuditEntry, AuditLog, AuditOperation, ChangeSet, Memory, MemoryStore, SurrealMemoryStore,
};

#[tokio::test]
async fn surrealkv_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("surrealkv://{}", dir.path().join("db").display());

    {
        let store = SurrealMemoryStore::connect(&url).await.unwrap();
        let memory = Memory::core("o", "prefers dark mode").with_id("m1");
        store
            .commit(
                ChangeSet::new("o")
                    .insert(memory.clone())
                    .audit(AuditEntry::new("s1", "o", 0, AuditOperation::SessionCompleted)),
            )
            .await
            .unwrap();
    }

    let store = SurrealMemoryStore::connect(&url).await.unwrap();
    let memory = store.get_memory("o", "m1").await.unwrap().unwrap();
    assert_eq!(memory.content, "prefers dark mode");

    let outcome = store.last_session_outcome("o").await.unwrap().unwrap();
    assert_eq!(outcome.session_id, "s1");
}
