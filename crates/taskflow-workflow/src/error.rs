//! Workflow errors.

use std::{path::PathBuf, time::Duration};

use taskflow_core::{Classify, ErrorKind, SessionId, WorkflowId};
use taskflow_memory::MemoryError;
use taskflow_session::SessionError;

use crate::backend::BackendError;

/// Invalid or unreadable workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),
    #[error("Invalid params for {step_type} step: {source}")]
    InvalidParams {
        step_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single step. Turns the workflow `failed`.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("No {0} backend configured")]
    MissingBackend(&'static str),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Step timed out after {0:?}")]
    Timeout(Duration),
    #[error("File operation on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Path escapes the working directory: {0}")]
    PathEscape(String),
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("Step output could not be serialized: {0}")]
    Output(#[from] serde_json::Error),
    #[error("No custom step handler named {0}")]
    UnknownHandler(String),
    #[error("{0}")]
    Failed(String),
}

impl Classify for StepError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ExecutionFailure
    }
}

/// Workflow engine error.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow not registered: {0}")]
    Unregistered(String),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("Too many running workflows (max {max})")]
    CapacityExceeded { max: usize },
    #[error("Workflow engine is shut down")]
    ShutDown,
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),
}

impl Classify for WorkflowError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unregistered(_) => ErrorKind::Unregistered,
            Self::SessionNotFound(_) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::ShutDown => ErrorKind::ExecutionFailure,
            Self::Session(e) => e.kind(),
            Self::Definition(DefinitionError::Io { .. }) => ErrorKind::PersistenceFailure,
            Self::Definition(_) => ErrorKind::ExecutionFailure,
        }
    }
}
