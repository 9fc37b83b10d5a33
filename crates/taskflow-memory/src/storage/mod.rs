//! Durable storage implementations.

#[cfg(feature = "fs")]
pub mod fs;
pub mod memory;

#[cfg(feature = "fs")]
pub use fs::FsBlobStorage;
pub use memory::InMemoryBlobStorage;
