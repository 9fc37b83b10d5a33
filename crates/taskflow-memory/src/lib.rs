//! Namespaced two-tier memory store.
//!
//! Values live in an in-memory working set keyed by `(namespace, key)` and
//! are persisted through a [`taskflow_core::BlobStorage`] backend, either on
//! every write or by a periodic autosave sweep.

pub mod entry;
pub mod error;
pub mod query;
pub mod storage;
pub mod store;

pub use entry::MemoryEntry;
pub use error::MemoryError;
pub use query::{SearchHit, SearchOptions, SearchQuery, SortBy, SortOrder};
#[cfg(feature = "fs")]
pub use storage::FsBlobStorage;
pub use storage::InMemoryBlobStorage;
pub use store::{MemoryConfig, MemoryStats, MemoryStore};
