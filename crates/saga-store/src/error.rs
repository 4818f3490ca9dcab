use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when reading or writing saga state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The instance was saved with a stale version.
    /// Another writer advanced it since it was loaded.
    #[error(
        "Version conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    Conflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga instance does not exist.
    #[error("Saga instance not found: {0}")]
    NotFound(SagaId),

    /// A record or snapshot was rejected before being written.
    #[error("Invalid write: {0}")]
    Invalid(String),

    /// A stored value could not be decoded.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for optimistic concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
