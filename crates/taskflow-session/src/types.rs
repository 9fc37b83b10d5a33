//! Session, checkpoint and workflow summary records.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskflow_core::{CheckpointId, SessionId, SessionStatus, WorkflowId, WorkflowStatus, session_namespace};
use uuid::Uuid;

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub workflows_executed: u64,
    pub memory_operations: u64,
    pub checkpoints_created: u64,
    pub errors: u64,
}

/// Compact record of a finished workflow, appended to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Session fields captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedState {
    pub workflows: Vec<WorkflowSummary>,
    pub stats: SessionStats,
    pub metadata: Map<String, Value>,
}

/// Immutable snapshot of a session and its memory namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub captured_state: CapturedState,
    /// Every key of the session namespace at capture time.
    pub memory_snapshot: BTreeMap<String, Value>,
}

/// A bounded unit of work with its own memory namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metadata: Map<String, Value>,
    pub memory_namespace: String,
    /// Oldest first.
    pub checkpoints: Vec<Checkpoint>,
    pub workflows: Vec<WorkflowSummary>,
    pub stats: SessionStats,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a new active session.
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            name: options
                .name
                .unwrap_or_else(|| format!("Session {}", now.format("%Y-%m-%d %H:%M:%S"))),
            description: options.description.unwrap_or_default(),
            status: SessionStatus::Active,
            start_time: now,
            end_time: None,
            duration_ms: None,
            metadata: options.metadata,
            memory_namespace: session_namespace(id),
            checkpoints: Vec::new(),
            workflows: Vec::new(),
            stats: SessionStats::default(),
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Whether the session has been open for at least `timeout`.
    #[must_use]
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.start_time) >= timeout
    }

    /// Most recent checkpoint.
    #[must_use]
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub(crate) fn capture(&self) -> CapturedState {
        CapturedState {
            workflows: self.workflows.clone(),
            stats: self.stats.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub(crate) fn apply(&mut self, state: CapturedState) {
        self.workflows = state.workflows;
        self.stats = state.stats;
        self.metadata = state.metadata;
        self.updated_at = Utc::now();
    }
}

/// Options for creating a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
}

impl SessionOptions {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Partial update applied by `SessionManager::update_session`.
///
/// Metadata keys are merged into the existing map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new(
            SessionOptions::named("seo audit")
                .with_description("weekly")
                .with_metadata("city", json!("Como")),
        );

        assert!(session.is_active());
        assert_eq!(session.name, "seo audit");
        assert_eq!(session.memory_namespace, format!("session:{}", session.id));
        assert_eq!(session.metadata["city"], "Como");
        assert!(session.end_time.is_none());
    }

    #[test]
    fn test_expiry() {
        let session = Session::new(SessionOptions::default());
        let now = Utc::now();
        assert!(session.is_expired(Duration::ZERO, now));
        assert!(!session.is_expired(Duration::from_secs(3600), now));
        assert!(session.is_expired(Duration::from_secs(3600), now + TimeDelta::hours(2)));
        assert!(!session.is_expired(Duration::MAX, now));
    }

    #[test]
    fn test_apply_replaces_captured_fields() {
        let mut session = Session::new(SessionOptions::default().with_metadata("a", json!(1)));
        let captured = session.capture();

        session.stats.errors = 4;
        session.metadata.insert("b".into(), json!(2));
        session.apply(captured);

        assert_eq!(session.stats.errors, 0);
        assert_eq!(session.metadata.len(), 1);
    }
}
