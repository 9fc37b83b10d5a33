//! Routed tasks, options and provider responses.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskflow_core::SessionId;

/// Identifies a provider in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// The in-process engine.
    Primary,
    /// The external command-line tool.
    ExternalTool,
    /// Canned responses; never fails.
    Static,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::ExternalTool => "external_tool",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task category used for routing and canned responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Workflow,
    Automation,
    CodeGeneration,
    Memory,
    Analysis,
    Generation,
    Greeting,
    Emergency,
    Services,
    Contact,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// A unit of work routed to one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    #[serde(default)]
    pub urgency: Urgency,
    /// Free-text instruction for generation and the external tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Workflow name for `workflow` tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Kind-specific parameters.
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    #[must_use]
    pub const fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            urgency: Urgency::Normal,
            instruction: None,
            workflow: None,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn workflow(name: impl Into<String>) -> Self {
        Self {
            workflow: Some(name.into()),
            ..Self::new(TaskKind::Workflow)
        }
    }

    #[must_use]
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub const fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}

/// Per-call routing and invocation options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub requires_real_time: bool,
    /// Pass `--quiet` to the external tool.
    pub quiet: bool,
    /// Pass `--continue` to the external tool.
    pub continue_session: bool,
    /// Overrides the provider's call timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,
    pub session_id: Option<SessionId>,
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider: ProviderKind,
    pub output: Value,
    pub success: bool,
}

impl ProviderResponse {
    #[must_use]
    pub const fn ok(provider: ProviderKind, output: Value) -> Self {
        Self {
            provider,
            output,
            success: true,
        }
    }
}
