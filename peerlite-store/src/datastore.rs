//! The datastore abstraction consumed by the routing tables.

use crate::batch::Batch;
use crate::error::{StoreError, StoreResult};

/// A key/value store for routing and provider records.
///
/// Implementations must be safe for concurrent use: both routing table
/// instances of a host may hold the same store and call into it from the
/// host's event loop while the caller inspects it from other threads.
pub trait Datastore: Send + Sync {
    /// Returns the value stored under `key`, or [`StoreError::NotFound`].
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Returns whether a value is stored under `key`.
    fn has(&self, key: &str) -> StoreResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns all entries whose key starts with `prefix`, ordered by key.
    fn query(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Applies every write in `batch` atomically.
    fn commit(&self, batch: Batch) -> StoreResult<()>;
}

/// Rejects keys that are not absolute `/`-separated paths.
pub(crate) fn check_key(key: &str) -> StoreResult<()> {
    if key.starts_with('/') && !key.contains("//") {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
