//! SurrealDB schema initialization
//!
//! Sets up the memory, audit, and owner-settings tables with their indexes.
//! Safe to call on every connection (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all memforge tables
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing memforge SurrealDB schema");

    init_memories_table(db).await?;
    init_audit_table(db).await?;
    init_settings_table(db).await?;

    info!("memforge schema initialization complete");
    Ok(())
}

/// `memories` table
///
/// ```text
/// TABLE memories {
///   memory_id:   STRING (unique)
///   owner_id:    STRING (indexed)
///   content:     STRING
///   kind:        STRING (core | journal)
///   protected:   BOOL
///   mass:        INT
///   created_at:  DATETIME (ledger order)
/// }
/// ```
async fn init_memories_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing memories table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS memories SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_memory_id ON TABLE memories COLUMNS memory_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_memory_owner ON TABLE memories COLUMNS owner_id;
        DEFINE INDEX IF NOT EXISTS idx_memory_owner_created ON TABLE memories COLUMNS owner_id, created_at;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// `audit_entries` table
///
/// Append-only: updates and deletes are denied for record-level access, and
/// the application never issues them.
async fn init_audit_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing audit_entries table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS audit_entries
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_audit_entry_id ON TABLE audit_entries COLUMNS entry_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_audit_session ON TABLE audit_entries COLUMNS session_id;
        DEFINE INDEX IF NOT EXISTS idx_audit_owner ON TABLE audit_entries COLUMNS owner_id;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// `owner_settings` table, one row per owner
async fn init_settings_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing owner_settings table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS owner_settings SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_settings_owner ON TABLE owner_settings COLUMNS owner_id UNIQUE;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;
    Ok(())
}
