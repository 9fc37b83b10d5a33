//! Canned-response provider, the last link of the fallback chain.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::{
    error::ProviderError,
    provider::Provider,
    task::{ProviderKind, ProviderResponse, Task, TaskKind, TaskOptions},
};

const GREETING: &str = "Hello! I'm the automation assistant. How can I help you today?";
const EMERGENCY: &str = "For urgent issues, describe the problem and the affected system. \
     The request has been flagged for immediate attention.";
const SERVICES: &str = "Available services: workflow automation, code analysis, \
     test execution and deployment.";
const CONTACT: &str = "You can reach the operations team through the support channel \
     listed in your project configuration.";
const APOLOGY: &str = "Sorry, I can't handle this request right now. Please try again later.";

/// Answers every task with a fixed message. Never fails.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    overrides: HashMap<TaskKind, String>,
}

impl StaticProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the canned message for one task kind.
    #[must_use]
    pub fn with_response(mut self, kind: TaskKind, message: impl Into<String>) -> Self {
        self.overrides.insert(kind, message.into());
        self
    }

    #[must_use]
    pub fn message_for(&self, kind: TaskKind) -> &str {
        if let Some(message) = self.overrides.get(&kind) {
            return message;
        }
        match kind {
            TaskKind::Greeting => GREETING,
            TaskKind::Emergency => EMERGENCY,
            TaskKind::Services => SERVICES,
            TaskKind::Contact => CONTACT,
            _ => APOLOGY,
        }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn execute(
        &self,
        task: &Task,
        _options: &TaskOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::ok(
            ProviderKind::Static,
            json!({ "message": self.message_for(task.kind) }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_kinds_get_their_message() {
        let provider = StaticProvider::new();
        let response = provider
            .execute(&Task::new(TaskKind::Greeting), &TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderKind::Static);
        assert!(response.success);
        assert_eq!(response.output["message"], GREETING);
    }

    #[tokio::test]
    async fn test_unknown_kinds_get_apology() {
        let provider = StaticProvider::new();
        for kind in [TaskKind::CodeGeneration, TaskKind::Workflow, TaskKind::Other] {
            let response = provider
                .execute(&Task::new(kind), &TaskOptions::default())
                .await
                .unwrap();
            assert_eq!(response.output["message"], APOLOGY);
        }
    }

    #[test]
    fn test_override() {
        let provider = StaticProvider::new().with_response(TaskKind::Contact, "ops@example.org");
        assert_eq!(provider.message_for(TaskKind::Contact), "ops@example.org");
        assert_eq!(provider.message_for(TaskKind::Services), SERVICES);
    }
}
