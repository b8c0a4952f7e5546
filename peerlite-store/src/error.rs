//! Error types for the record store.

use thiserror::Error;

/// Result type for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in datastore operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No value is stored under the key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Key is not a valid datastore path.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("datastore lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Returns true if this error only means the key is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
