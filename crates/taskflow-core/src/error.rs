//! Error kinds exposed to outer layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse error classification shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A session, workflow, checkpoint or memory key is absent.
    NotFound,
    /// The workflow concurrency cap was hit.
    CapacityExceeded,
    /// Unknown workflow name.
    Unregistered,
    /// Every provider in the fallback chain failed.
    ProviderUnavailable,
    /// Durable store I/O or encoding failed.
    PersistenceFailure,
    /// A workflow step handler failed.
    ExecutionFailure,
}

impl ErrorKind {
    /// Stable identifier for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Unregistered => "unregistered",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::PersistenceFailure => "persistence_failure",
            Self::ExecutionFailure => "execution_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so outer layers can classify it.
pub trait Classify: std::error::Error {
    /// The coarse kind of this error.
    fn kind(&self) -> ErrorKind;

    /// User-visible report: kind and message, nothing else.
    fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// What an outer layer may show to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Flatten an error and its sources into one line per cause.
#[must_use]
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    impl Classify for Outer {
        fn kind(&self) -> ErrorKind {
            ErrorKind::PersistenceFailure
        }
    }

    #[test]
    fn test_report_has_kind_and_message() {
        let err = Outer(std::io::Error::other("disk full"));
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::PersistenceFailure);
        assert_eq!(report.message, "outer");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "persistence_failure");
    }

    #[test]
    fn test_error_chain() {
        let err = Outer(std::io::Error::other("disk full"));
        assert_eq!(error_chain(&err), vec!["outer".to_string(), "disk full".to_string()]);
    }
}
