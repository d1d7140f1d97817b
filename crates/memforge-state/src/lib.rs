//! memforge-state: persistence layer for memforge
//!
//! This crate owns every byte memforge writes: owner-scoped memories, the
//! append-only audit log, and per-owner settings.
//!
//! ## Key Components
//!
//! - `MemoryStore` / `AuditLog`: backend-agnostic async traits
//! - `ChangeSet`: memory writes and audit entries that commit atomically
//! - `InMemoryStore`: mutex-guarded fake for tests and dry runs
//! - `SurrealMemoryStore`: SurrealDB backend (`mem://`, `surrealkv://`, `ws://`)

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
mod surreal_store;

pub use error::StorageError;
pub use fakes::InMemoryStore;
pub use schema::{
    estimate_mass, AuditEntry, AuditOperation, AuditOutcome, Memory, MemoryKind, OwnerSettings,
    MAX_CONTENT_CHARS,
};
pub use storage_traits::{
    AuditLog, ChangeSet, MemoryStore, MemoryWrite, StorageResult, Store,
};
pub use surreal_store::{CloudConfig, SurrealMemoryStore};
