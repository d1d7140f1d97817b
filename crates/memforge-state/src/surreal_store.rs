//! SurrealDB-backed `MemoryStore` and `AuditLog`
//!
//! Uses private row types (`DbMemory`, `DbAuditEntry`, `DbOwnerSettings`) so
//! timestamps are stored as native SurrealDB datetimes, converting to the
//! shared records at the boundary. A `ChangeSet` is validated against the
//! current rows and then written inside one `BEGIN/COMMIT TRANSACTION` block.
//!
//! Supports in-memory (`mem://`), local (`surrealkv://`), and remote
//! (`ws://`, `wss://`) connections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::migrations;
use crate::schema::{AuditEntry, AuditOperation, AuditOutcome, Memory, MemoryKind, OwnerSettings};
use crate::storage_traits::{AuditLog, ChangeSet, MemoryStore, MemoryWrite, StorageResult};

const DEFAULT_NAMESPACE: &str = "memforge";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".memforge/db";

/// Configuration for a SurrealDB Cloud (or any authenticated remote) connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "memforge")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "memforge")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbMemory {
    memory_id: String,
    owner_id: String,
    content: String,
    kind: MemoryKind,
    protected: bool,
    mass: u64,
    created_at: SurrealDatetime,
}

impl From<&Memory> for DbMemory {
    fn from(m: &Memory) -> Self {
        DbMemory {
            memory_id: m.id.clone(),
            owner_id: m.owner_id.clone(),
            content: m.content.clone(),
            kind: m.kind,
            protected: m.protected,
            mass: m.mass,
            created_at: SurrealDatetime::from(m.created_at),
        }
    }
}

impl DbMemory {
    fn into_memory(self) -> Memory {
        Memory {
            id: self.memory_id,
            owner_id: self.owner_id,
            content: self.content,
            kind: self.kind,
            protected: self.protected,
            mass: self.mass,
            created_at: DateTime::<Utc>::from(self.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbAuditEntry {
    entry_id: String,
    session_id: String,
    owner_id: String,
    seq: u64,
    operation: AuditOperation,
    outcome: AuditOutcome,
    memory_id: Option<String>,
    before_content: Option<String>,
    after_content: Option<String>,
    subject: Option<Memory>,
    detail: serde_json::Value,
    created_at: SurrealDatetime,
}

impl From<&AuditEntry> for DbAuditEntry {
    fn from(e: &AuditEntry) -> Self {
        DbAuditEntry {
            entry_id: e.id.clone(),
            session_id: e.session_id.clone(),
            owner_id: e.owner_id.clone(),
            seq: e.seq,
            operation: e.operation,
            outcome: e.outcome,
            memory_id: e.memory_id.clone(),
            before_content: e.before_content.clone(),
            after_content: e.after_content.clone(),
            subject: e.subject.clone(),
            detail: e.detail.clone(),
            created_at: SurrealDatetime::from(e.created_at),
        }
    }
}

impl DbAuditEntry {
    fn into_entry(self) -> AuditEntry {
        AuditEntry {
            id: self.entry_id,
            session_id: self.session_id,
            owner_id: self.owner_id,
            seq: self.seq,
            operation: self.operation,
            outcome: self.outcome,
            memory_id: self.memory_id,
            before_content: self.before_content,
            after_content: self.after_content,
            subject: self.subject,
            detail: self.detail,
            created_at: DateTime::<Utc>::from(self.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbOwnerSettings {
    owner_id: String,
    retention_threshold: Option<f64>,
    style_prompt: Option<String>,
    updated_at: SurrealDatetime,
}

#[derive(Debug, Deserialize)]
struct IdOwner {
    memory_id: String,
    owner_id: String,
}

// ---------------------------------------------------------------------------
// SurrealMemoryStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`MemoryStore`] and [`AuditLog`].
#[derive(Clone)]
pub struct SurrealMemoryStore {
    db: Surreal<Any>,
}

impl SurrealMemoryStore {
    /// In-memory instance (tests, dry runs).
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any URL the `any` engine understands and initialize the schema.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealMemoryStore connected");
        Ok(Self { db })
    }

    /// Connect with credentials.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn connect_cloud(config: CloudConfig) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Connection(format!("root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Connection(format!("database auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealMemoryStore connected (cloud)");
        Ok(Self { db })
    }

    /// Connect using environment variables.
    ///
    /// If SURREALDB_ENDPOINT is set, connects with credentials.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, persists locally under `.memforge/db`.
    pub async fn from_env() -> StorageResult<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::connect_cloud(config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }

        std::fs::create_dir_all(LOCAL_DB_PATH).map_err(|e| {
            StorageError::Connection(format!(
                "failed to create database directory {LOCAL_DB_PATH}: {e}"
            ))
        })?;
        info!(
            "No cloud config or SURREALDB_URL found, using local persistence: {}",
            LOCAL_DB_PATH
        );
        Self::connect(&format!("surrealkv://{LOCAL_DB_PATH}")).await
    }

    async fn owners_of(&self, ids: Vec<String>) -> StorageResult<Vec<IdOwner>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut result = self
            .db
            .query("SELECT memory_id, owner_id FROM memories WHERE memory_id IN $ids")
            .bind(("ids", ids))
            .await?;
        Ok(result.take(0)?)
    }
}

/// Render the transaction body for a change set. Binding names follow the
/// statement index so the caller can bind values in the same order.
fn transaction_sql(changes: &ChangeSet) -> String {
    let mut sql = String::from("BEGIN TRANSACTION;\n");
    for (i, write) in changes.writes.iter().enumerate() {
        let stmt = match write {
            MemoryWrite::Insert(_) => format!("CREATE memories CONTENT $w{i};\n"),
            MemoryWrite::Replace(_) => {
                format!("UPDATE memories CONTENT $w{i} WHERE memory_id = $wid{i};\n")
            }
            MemoryWrite::Delete { .. } => format!("DELETE memories WHERE memory_id = $wid{i};\n"),
        };
        sql.push_str(&stmt);
    }
    for i in 0..changes.audit.len() {
        sql.push_str(&format!("CREATE audit_entries CONTENT $a{i};\n"));
    }
    sql.push_str("COMMIT TRANSACTION;");
    sql
}

#[async_trait]
impl MemoryStore for SurrealMemoryStore {
    #[instrument(skip(self, memory), fields(memory_id = %memory.id, owner_id = %memory.owner_id))]
    async fn insert_memory(&self, memory: Memory) -> StorageResult<()> {
        if !self.owners_of(vec![memory.id.clone()]).await?.is_empty() {
            return Err(StorageError::DuplicateMemory {
                memory_id: memory.id,
            });
        }

        let created: Option<DbMemory> = self
            .db
            .create("memories")
            .content(DbMemory::from(&memory))
            .await?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend("failed to create memory".to_string()))
    }

    #[instrument(skip(self))]
    async fn get_memory(&self, owner_id: &str, memory_id: &str) -> StorageResult<Option<Memory>> {
        let mut result = self
            .db
            .query("SELECT * FROM memories WHERE memory_id = $id AND owner_id = $owner")
            .bind(("id", memory_id.to_string()))
            .bind(("owner", owner_id.to_string()))
            .await?;
        let rows: Vec<DbMemory> = result.take(0)?;
        Ok(rows.into_iter().next().map(DbMemory::into_memory))
    }

    #[instrument(skip(self))]
    async fn list_memories(
        &self,
        owner_id: &str,
        kind: Option<MemoryKind>,
    ) -> StorageResult<Vec<Memory>> {
        let mut result = match kind {
            Some(kind) => {
                self.db
                    .query(
                        "SELECT * FROM memories WHERE owner_id = $owner AND kind = $kind \
                         ORDER BY created_at ASC, memory_id ASC",
                    )
                    .bind(("owner", owner_id.to_string()))
                    .bind(("kind", kind.as_str().to_string()))
                    .await?
            }
            None => {
                self.db
                    .query(
                        "SELECT * FROM memories WHERE owner_id = $owner \
                         ORDER BY created_at ASC, memory_id ASC",
                    )
                    .bind(("owner", owner_id.to_string()))
                    .await?
            }
        };
        let rows: Vec<DbMemory> = result.take(0)?;
        Ok(rows.into_iter().map(DbMemory::into_memory).collect())
    }

    #[instrument(skip(self))]
    async fn list_owners(&self) -> StorageResult<Vec<String>> {
        let mut result = self.db.query("SELECT VALUE owner_id FROM memories").await?;
        let mut owners: Vec<String> = result.take(0)?;
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    #[instrument(skip(self))]
    async fn owner_settings(&self, owner_id: &str) -> StorageResult<Option<OwnerSettings>> {
        let mut result = self
            .db
            .query("SELECT * FROM owner_settings WHERE owner_id = $owner")
            .bind(("owner", owner_id.to_string()))
            .await?;
        let rows: Vec<DbOwnerSettings> = result.take(0)?;
        Ok(rows.into_iter().next().map(|row| OwnerSettings {
            owner_id: row.owner_id,
            retention_threshold: row.retention_threshold,
            style_prompt: row.style_prompt,
            updated_at: DateTime::<Utc>::from(row.updated_at),
        }))
    }

    #[instrument(skip(self, settings), fields(owner_id = %settings.owner_id))]
    async fn put_owner_settings(&self, settings: OwnerSettings) -> StorageResult<()> {
        let row = DbOwnerSettings {
            owner_id: settings.owner_id.clone(),
            retention_threshold: settings.retention_threshold,
            style_prompt: settings.style_prompt,
            updated_at: SurrealDatetime::from(settings.updated_at),
        };
        self.db
            .query(
                "BEGIN TRANSACTION;\n\
                 DELETE owner_settings WHERE owner_id = $owner;\n\
                 CREATE owner_settings CONTENT $settings;\n\
                 COMMIT TRANSACTION;",
            )
            .bind(("owner", settings.owner_id))
            .bind(("settings", row))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self, changes), fields(owner_id = %changes.owner_id, writes = changes.writes.len(), audit = changes.audit.len()))]
    async fn commit(&self, changes: ChangeSet) -> StorageResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let existing = self.owners_of(changes.touched_ids()).await?;
        changes.validate(|id| {
            existing
                .iter()
                .find(|row| row.memory_id == id)
                .map(|row| row.owner_id.clone())
        })?;

        let sql = transaction_sql(&changes);
        debug!("Committing change set");

        let mut query = self.db.query(sql);
        for (i, write) in changes.writes.iter().enumerate() {
            query = match write {
                MemoryWrite::Insert(memory) => query.bind((format!("w{i}"), DbMemory::from(memory))),
                MemoryWrite::Replace(memory) => query
                    .bind((format!("w{i}"), DbMemory::from(memory)))
                    .bind((format!("wid{i}"), memory.id.clone())),
                MemoryWrite::Delete { memory_id } => {
                    query.bind((format!("wid{i}"), memory_id.clone()))
                }
            };
        }
        for (i, entry) in changes.audit.iter().enumerate() {
            query = query.bind((format!("a{i}"), DbAuditEntry::from(entry)));
        }

        query
            .await?
            .check()
            .map_err(|e| StorageError::Backend(format!("transaction failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for SurrealMemoryStore {
    #[instrument(skip(self, entry), fields(session_id = %entry.session_id, operation = %entry.operation))]
    async fn append(&self, entry: AuditEntry) -> StorageResult<()> {
        let created: Option<DbAuditEntry> = self
            .db
            .create("audit_entries")
            .content(DbAuditEntry::from(&entry))
            .await?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend("failed to append audit entry".to_string()))
    }

    #[instrument(skip(self))]
    async fn session_entries(&self, session_id: &str) -> StorageResult<Vec<AuditEntry>> {
        let mut result = self
            .db
            .query("SELECT * FROM audit_entries WHERE session_id = $session ORDER BY seq ASC")
            .bind(("session", session_id.to_string()))
            .await?;
        let rows: Vec<DbAuditEntry> = result.take(0)?;
        Ok(rows.into_iter().map(DbAuditEntry::into_entry).collect())
    }

    #[instrument(skip(self))]
    async fn owner_entries(&self, owner_id: &str, limit: usize) -> StorageResult<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT * FROM audit_entries WHERE owner_id = $owner \
             ORDER BY created_at DESC, seq DESC LIMIT {limit}"
        );
        let mut result = self
            .db
            .query(sql)
            .bind(("owner", owner_id.to_string()))
            .await?;
        let rows: Vec<DbAuditEntry> = result.take(0)?;
        Ok(rows.into_iter().map(DbAuditEntry::into_entry).collect())
    }

    #[instrument(skip(self))]
    async fn last_session_outcome(&self, owner_id: &str) -> StorageResult<Option<AuditEntry>> {
        let outcomes: Vec<String> = [
            AuditOperation::SessionCompleted,
            AuditOperation::SessionRolledBack,
            AuditOperation::SessionAbandoned,
            AuditOperation::RollbackFailed,
        ]
        .iter()
        .map(|op| op.as_str().to_string())
        .collect();

        let mut result = self
            .db
            .query(
                "SELECT * FROM audit_entries WHERE owner_id = $owner AND operation IN $ops \
                 ORDER BY created_at DESC, seq DESC LIMIT 1",
            )
            .bind(("owner", owner_id.to_string()))
            .bind(("ops", outcomes))
            .await?;
        let rows: Vec<DbAuditEntry> = result.take(0)?;
        Ok(rows.into_iter().next().map(DbAuditEntry::into_entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_sql_binds_by_index() {
        let changes = ChangeSet::new("o")
            .insert(Memory::core("o", "new").with_id("n"))
            .delete("old")
            .audit(AuditEntry::new("s", "o", 0, AuditOperation::ConsolidateCreate));
        let sql = transaction_sql(&changes);
        assert!(sql.starts_with("BEGIN TRANSACTION;"));
        assert!(sql.contains("CREATE memories CONTENT $w0;"));
        assert!(sql.contains("DELETE memories WHERE memory_id = $wid1;"));
        assert!(sql.contains("CREATE audit_entries CONTENT $a0;"));
        assert!(sql.ends_with("COMMIT TRANSACTION;"));
    }

    #[tokio::test]
    async fn test_surreal_connection_and_schema_creation() {
        let store = SurrealMemoryStore::in_memory().await;
        assert!(store.is_ok(), "Failed to connect: {:?}", store.err());
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let store = SurrealMemoryStore::in_memory().await.unwrap();
        migrations::init_schema(&store.db).await.unwrap();
    }
}
