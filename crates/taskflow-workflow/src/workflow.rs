//! Workflow execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskflow_core::{SessionId, WorkflowId, WorkflowStatus};
use taskflow_session::WorkflowSummary;
use uuid::Uuid;

use crate::definition::WorkflowDefinition;

/// Outcome of one executed step. Failed steps are recorded too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a workflow failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub message: String,
    /// The error and each of its sources, outermost first.
    pub trace: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Summary attached to a completed workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub duration_ms: i64,
    pub steps_completed: usize,
    pub step_results: Vec<Value>,
    pub summary: String,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    /// Catalog name the workflow was started under.
    pub name: String,
    pub definition: WorkflowDefinition,
    pub session_id: Option<SessionId>,
    pub status: WorkflowStatus,
    /// 0 to 100.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    pub result: Option<WorkflowResult>,
    pub error: Option<WorkflowFailure>,
}

impl Workflow {
    pub(crate) fn new(
        name: &str,
        definition: WorkflowDefinition,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            definition,
            session_id,
            status: WorkflowStatus::Running,
            progress: 0,
            started_at: Utc::now(),
            ended_at: None,
            steps: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Milliseconds between start and end (or now, while running).
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.ended_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// Compact summary appended to the owning session.
    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            result: self
                .result
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok()),
        }
    }

    pub(crate) fn build_result(&self) -> WorkflowResult {
        WorkflowResult {
            workflow_id: self.id,
            name: self.name.clone(),
            duration_ms: self.duration_ms(),
            steps_completed: self.steps.len(),
            step_results: self.steps.iter().map(|s| s.value.clone()).collect(),
            summary: format!(
                "Workflow {} completed successfully with {} steps",
                self.name,
                self.steps.len()
            ),
        }
    }
}

/// Progress after `completed` of `total` steps, rounded to the nearest percent.
#[must_use]
pub fn progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let rounded = (completed * 200 + total) / (2 * total);
    u8::try_from(rounded.min(100)).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rounding() {
        assert_eq!(progress(1, 3), 33);
        assert_eq!(progress(2, 3), 67);
        assert_eq!(progress(3, 3), 100);
        assert_eq!(progress(1, 8), 13);
        assert_eq!(progress(0, 0), 100);
    }
}
