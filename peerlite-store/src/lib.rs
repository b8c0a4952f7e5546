//! Record store backends for peerlite.
//!
//! The routing tables persist routing and provider records through the
//! [`Datastore`] trait. Two backends are provided:
//!
//! - [`MemoryDatastore`]: lives in memory only, everything is lost on shutdown
//! - [`SqliteDatastore`]: durable store backed by a single SQLite file
//!
//! Keys are `/`-separated path strings (for example `/public/records/0a1b`),
//! values are opaque bytes. All backends are safe to share between threads.

mod batch;
mod datastore;
mod error;
mod memory;
mod sqlite;

pub use batch::{Batch, BatchOp};
pub use datastore::Datastore;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryDatastore;
pub use sqlite::SqliteDatastore;

use std::sync::Arc;

/// Returns a shareable datastore that lives in memory only and is not persisted.
pub fn new_in_memory_datastore() -> Arc<dyn Datastore> {
    Arc::new(MemoryDatastore::new())
}
