//! Memory store errors.

use taskflow_core::{Classify, ErrorKind, StorageError};

/// Memory store error.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Persistence failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for MemoryError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PersistenceFailure
    }
}
