//! Declarative workflow definitions and step kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps,
        }
    }
}

/// One step of a workflow.
///
/// On the wire a step is `{"name", "type", "params"}`; the type tag is
/// resolved into a [`StepKind`] when the definition is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
}

impl Step {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Closed set of step kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    CodeAnalysis(AnalysisParams),
    FileOperation(FileParams),
    AiTask(AiTaskParams),
    TestExecution(TestParams),
    Deployment(DeployParams),
    MemoryOperation(MemoryParams),
    /// Named handler registered on the engine.
    Custom(CustomParams),
}

impl StepKind {
    /// Wire name of the step type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::CodeAnalysis(_) => "code_analysis",
            Self::FileOperation(_) => "file_operation",
            Self::AiTask(_) => "ai_task",
            Self::TestExecution(_) => "test_execution",
            Self::Deployment(_) => "deployment",
            Self::MemoryOperation(_) => "memory_operation",
            Self::Custom(_) => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub target: String,
    pub analysis_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Exists,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParams {
    pub operation: FileOperation,
    pub path: String,
    /// Required for `write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiTaskParams {
    pub task: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestParams {
    pub test_type: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    pub environment: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Store,
    Retrieve,
    /// Text search using `key` as the query.
    Search,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryParams {
    pub operation: MemoryOperation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Defaults to the session namespace, or `default` without a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomParams {
    pub handler: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Serialize, Deserialize)]
struct RawStep {
    name: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    params: Value,
}

impl TryFrom<RawStep> for Step {
    type Error = DefinitionError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        fn params<T: serde::de::DeserializeOwned>(
            step_type: &str,
            params: Value,
        ) -> Result<T, DefinitionError> {
            serde_json::from_value(params).map_err(|source| DefinitionError::InvalidParams {
                step_type: step_type.to_string(),
                source,
            })
        }

        let t = raw.step_type.as_str();
        let kind = match t {
            "code_analysis" => StepKind::CodeAnalysis(params(t, raw.params)?),
            "file_operation" => StepKind::FileOperation(params(t, raw.params)?),
            "ai_task" => StepKind::AiTask(params(t, raw.params)?),
            "test_execution" => StepKind::TestExecution(params(t, raw.params)?),
            "deployment" => StepKind::Deployment(params(t, raw.params)?),
            "memory_operation" => StepKind::MemoryOperation(params(t, raw.params)?),
            "custom" => StepKind::Custom(params(t, raw.params)?),
            other => return Err(DefinitionError::UnknownStepType(other.to_string())),
        };

        Ok(Self {
            name: raw.name,
            kind,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let step_type = step.kind.type_name().to_string();
        let params = match step.kind {
            StepKind::CodeAnalysis(p) => serde_json::to_value(p),
            StepKind::FileOperation(p) => serde_json::to_value(p),
            StepKind::AiTask(p) => serde_json::to_value(p),
            StepKind::TestExecution(p) => serde_json::to_value(p),
            StepKind::Deployment(p) => serde_json::to_value(p),
            StepKind::MemoryOperation(p) => serde_json::to_value(p),
            StepKind::Custom(p) => serde_json::to_value(p),
        }
        .unwrap_or_default();

        Self {
            name: step.name,
            step_type,
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_definition() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "Audit",
            "steps": [
                {"name": "List", "type": "file_operation", "params": {"operation": "list", "path": "."}},
                {"name": "Remember", "type": "memory_operation",
                 "params": {"operation": "store", "key": "k", "data": {"a": 1}}},
                {"name": "Hook", "type": "custom", "params": {"handler": "notify"}}
            ]
        }))
        .unwrap();

        assert_eq!(def.description, "");
        assert_eq!(def.steps.len(), 3);
        assert!(matches!(
            &def.steps[0].kind,
            StepKind::FileOperation(FileParams { operation: FileOperation::List, .. })
        ));
        let StepKind::Custom(custom) = &def.steps[2].kind else {
            panic!("expected custom step");
        };
        assert_eq!(custom.handler, "notify");
        assert_eq!(custom.args, Value::Null);
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let err = serde_json::from_value::<Step>(json!({"name": "x", "type": "teleport"}))
            .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_bad_params_rejected() {
        let err = serde_json::from_value::<Step>(json!({
            "name": "x", "type": "file_operation", "params": {"operation": "chmod", "path": "."}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("file_operation"));
    }

    #[test]
    fn test_serializes_to_wire_shape() {
        let step = Step::new(
            "Deploy",
            StepKind::Deployment(DeployParams {
                environment: "production".into(),
                target: "site".into(),
            }),
        );
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"name": "Deploy", "type": "deployment",
                   "params": {"environment": "production", "target": "site"}})
        );
    }
}
