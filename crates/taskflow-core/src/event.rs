//! Lifecycle events published by the engine components.

use serde::{Deserialize, Serialize};

use crate::traits::{CheckpointId, SessionId, WorkflowId};

/// A lifecycle transition observed somewhere in the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    SessionCreated {
        session_id: SessionId,
        name: String,
    },
    SessionEnded {
        session_id: SessionId,
        duration_ms: i64,
    },
    CheckpointCreated {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
        description: String,
    },
    CheckpointRestored {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        name: String,
        session_id: Option<SessionId>,
    },
    WorkflowProgress {
        workflow_id: WorkflowId,
        step_index: usize,
        progress: u8,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        duration_ms: i64,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        error: String,
    },
    WorkflowCancelled {
        workflow_id: WorkflowId,
    },
    MemoryStored {
        namespace: String,
        key: String,
    },
    MemoryRetrieved {
        namespace: String,
        key: String,
    },
    MemoryDeleted {
        namespace: String,
        key: String,
    },
    MemoryCleared {
        namespace: Option<String>,
    },
}

impl FlowEvent {
    /// Workflow this event refers to, if any.
    #[must_use]
    pub const fn workflow_id(&self) -> Option<WorkflowId> {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::WorkflowProgress { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id } => Some(*workflow_id),
            _ => None,
        }
    }

    /// Whether this event ends a workflow.
    #[must_use]
    pub const fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}
