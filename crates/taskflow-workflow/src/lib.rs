//! Sequential workflow execution for taskflow.
//!
//! Provides:
//! - `WorkflowEngine` - Run catalog workflows in the background
//! - `WorkflowCatalog` - Built-in and file-loaded definitions
//! - Backend traits for analysis, text generation, tests and deployment
//! - `CustomStepHandler` - Named extension point for `custom` steps

pub mod backend;
pub mod catalog;
pub mod definition;
pub mod engine;
pub mod error;
pub mod step;
pub mod workflow;

pub use backend::{
    AnalysisReport, AnalysisRequest, BackendError, Backends, DeployRequest, DeployTarget,
    Deployment, Generation, GenerationRequest, QualityMetrics, TestReport, TestRequest,
    TestRunner, TextGeneration, TokenUsage,
};
pub use catalog::{CatalogEntry, WorkflowCatalog, builtin_workflows};
pub use definition::{
    AiTaskParams, AnalysisParams, CustomParams, DeployParams, FileOperation, FileParams,
    MemoryOperation, MemoryParams, Step, StepKind, TestParams, WorkflowDefinition,
};
pub use engine::{ExecuteOptions, WorkflowConfig, WorkflowEngine};
pub use error::{DefinitionError, StepError, WorkflowError};
pub use step::{CustomStepHandler, StepContext, StepExecutor, run_memory_operation};
pub use workflow::{StepRecord, Workflow, WorkflowFailure, WorkflowResult};
