//! External services invoked by workflow steps.
//!
//! Each backend takes a typed request and returns a typed response or a
//! [`BackendError`]. Implementations live outside this crate.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend call error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend call failed: {0}")]
    Failed(String),
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub target: String,
    pub analysis_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub issues: Vec<String>,
    /// Metric name to score, e.g. `complexity`, `maintainability`.
    pub metrics: BTreeMap<String, f64>,
    pub suggestions: Vec<String>,
}

/// Static code quality analysis.
#[async_trait]
pub trait QualityMetrics: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task: String,
    pub prompt: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Which provider produced the text.
    pub provider: String,
    pub model: Option<String>,
    pub text: String,
    pub usage: TokenUsage,
}

/// Text generation used by `ai_task` steps.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub test_type: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub total_tests: u32,
    pub failed_tests: u32,
    /// Line coverage in percent.
    pub coverage: f64,
    pub duration_ms: u64,
}

/// Test suite runner.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, request: TestRequest) -> Result<TestReport, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub environment: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    /// Where the deployed target is reachable.
    pub url: String,
}

/// Deployment target.
#[async_trait]
pub trait DeployTarget: Send + Sync {
    async fn deploy(&self, request: DeployRequest) -> Result<Deployment, BackendError>;
}

/// Backends available to a workflow engine. Missing ones fail their steps.
#[derive(Clone, Default)]
pub struct Backends {
    pub quality: Option<Arc<dyn QualityMetrics>>,
    pub text: Option<Arc<dyn TextGeneration>>,
    pub tests: Option<Arc<dyn TestRunner>>,
    pub deploy: Option<Arc<dyn DeployTarget>>,
}

impl Backends {
    #[must_use]
    pub fn with_quality(mut self, backend: Arc<dyn QualityMetrics>) -> Self {
        self.quality = Some(backend);
        self
    }

    #[must_use]
    pub fn with_text(mut self, backend: Arc<dyn TextGeneration>) -> Self {
        self.text = Some(backend);
        self
    }

    #[must_use]
    pub fn with_tests(mut self, backend: Arc<dyn TestRunner>) -> Self {
        self.tests = Some(backend);
        self
    }

    #[must_use]
    pub fn with_deploy(mut self, backend: Arc<dyn DeployTarget>) -> Self {
        self.deploy = Some(backend);
        self
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("quality", &self.quality.is_some())
            .field("text", &self.text.is_some())
            .field("tests", &self.tests.is_some())
            .field("deploy", &self.deploy.is_some())
            .finish()
    }
}
