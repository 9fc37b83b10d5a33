use taskflow_core::{Classify, ErrorKind, StorageError};
use taskflow_memory::MemoryError;
use taskflow_router::RouterError;
use taskflow_session::SessionError;
use taskflow_workflow::WorkflowError;
use thiserror::Error;

/// Engine facade error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("External tool is not available")]
    ExternalToolUnavailable,
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) => ErrorKind::PersistenceFailure,
            Self::Memory(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Workflow(e) => e.kind(),
            Self::Router(e) => e.kind(),
            Self::ExternalToolUnavailable => ErrorKind::ProviderUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
