use std::time::Duration;

use taskflow_core::{Classify, ErrorKind};
use thiserror::Error;

use crate::{
    command::CommandBuildError,
    task::{ProviderKind, TaskKind},
};

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider {0} is not registered")]
    NotRegistered(ProviderKind),

    #[error("Provider {provider} is unavailable: {reason}")]
    Unavailable {
        provider: ProviderKind,
        reason: String,
    },

    #[error("Unsupported task type: {0:?}")]
    Unsupported(TaskKind),

    #[error("Task has no instruction")]
    MissingInstruction,

    #[error("External tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("External tool exited with {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Command(#[from] CommandBuildError),

    #[error("External tool I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Router error.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Every provider in the chain failed; carries the first failure.
    #[error("No provider could handle the task: {source}")]
    ProviderUnavailable {
        #[source]
        source: ProviderError,
    },
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRegistered(_) | Self::Unavailable { .. } => ErrorKind::ProviderUnavailable,
            _ => ErrorKind::ExecutionFailure,
        }
    }
}

impl Classify for RouterError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ProviderUnavailable
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
