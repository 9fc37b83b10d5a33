//! Core identifiers, status enums and the durable storage trait.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Workflow execution identifier.
pub type WorkflowId = Uuid;

/// Checkpoint identifier.
pub type CheckpointId = Uuid;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is accepting work and taking periodic checkpoints.
    Active,
    /// Session has been ended; no further checkpoints are taken.
    Ended,
}

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps are executing in the background.
    Running,
    /// All steps completed successfully.
    Completed,
    /// A step failed.
    Failed,
    /// Cancelled by engine shutdown.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Lowercase name as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid record name: {0}")]
    InvalidName(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Namespaced blob storage backing the memory store.
///
/// One record per `(namespace, key)`. Implementations only move bytes;
/// encoding is the caller's concern.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read a record.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a record, replacing any previous value.
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// List the keys stored in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// List every namespace holding at least one record.
    async fn namespaces(&self) -> Result<Vec<String>, StorageError>;
}
