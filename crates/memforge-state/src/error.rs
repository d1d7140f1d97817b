//! Error types for memforge-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// Backend query or transaction error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Memory does not exist for the owner
    #[error("memory not found: {memory_id} (owner {owner_id})")]
    MemoryNotFound { owner_id: String, memory_id: String },

    /// Insert collided with an existing memory id
    #[error("memory already exists: {memory_id}")]
    DuplicateMemory { memory_id: String },

    /// A change set touched a memory that belongs to another owner
    #[error("change set for owner {expected} touches memory {memory_id} owned by {actual}")]
    OwnerMismatch {
        expected: String,
        actual: String,
        memory_id: String,
    },
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
