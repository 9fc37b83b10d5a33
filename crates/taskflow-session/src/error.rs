//! Session manager errors.

use taskflow_core::{CheckpointId, Classify, ErrorKind, SessionId};
use taskflow_memory::MemoryError;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Checkpoint {checkpoint_id} not found in session {session_id}")]
    CheckpointNotFound {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
    },
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

impl Classify for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::CheckpointNotFound { .. } => ErrorKind::NotFound,
            Self::Memory(e) => e.kind(),
        }
    }
}
