//! Glue between the router and the workflow engine.
//!
//! - [`EngineProvider`] is the router's primary provider: it runs workflows,
//!   memory operations, analysis and text generation in-process.
//! - [`RoutedTextGeneration`] sends `ai_task` steps through the router.
//! - [`ExternalToolStep`] runs `custom` steps through the external tool.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Value, json};
use taskflow_core::{DEFAULT_NAMESPACE, session_namespace};
use taskflow_memory::MemoryStore;
use taskflow_router::{
    ExternalToolProvider, Provider, ProviderError, ProviderKind, ProviderResponse, ProviderRouter,
    Task, TaskKind, TaskOptions,
};
use taskflow_workflow::{
    AnalysisParams, AnalysisRequest, BackendError, CustomStepHandler, ExecuteOptions, Generation,
    GenerationRequest, MemoryParams, QualityMetrics, StepContext, StepError, TextGeneration,
    TokenUsage, WorkflowEngine, run_memory_operation,
};

/// Custom step handler name bound to the external tool.
pub const EXTERNAL_TOOL_HANDLER: &str = "external_tool";

/// The in-process engine as a router provider.
pub struct EngineProvider {
    workflows: Weak<WorkflowEngine>,
    memory: Arc<MemoryStore>,
    quality: Option<Arc<dyn QualityMetrics>>,
    text: Option<Arc<dyn TextGeneration>>,
}

impl EngineProvider {
    pub(crate) const fn new(
        workflows: Weak<WorkflowEngine>,
        memory: Arc<MemoryStore>,
        quality: Option<Arc<dyn QualityMetrics>>,
        text: Option<Arc<dyn TextGeneration>>,
    ) -> Self {
        Self {
            workflows,
            memory,
            quality,
            text,
        }
    }

    async fn run_workflow(&self, task: &Task, options: &TaskOptions) -> Result<Value, ProviderError> {
        let engine = self.workflows.upgrade().ok_or_else(|| ProviderError::Unavailable {
            provider: ProviderKind::Primary,
            reason: "engine is shut down".into(),
        })?;
        let name = task
            .workflow
            .as_deref()
            .or_else(|| task.payload.get("workflow").and_then(Value::as_str))
            .ok_or_else(|| ProviderError::Failed("Task names no workflow".into()))?;

        let started = engine
            .execute_workflow(
                name,
                ExecuteOptions {
                    session_id: options.session_id,
                },
            )
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        let finished = engine
            .wait_for(started.id)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;

        if let Some(error) = &finished.error {
            return Err(ProviderError::Failed(error.message.clone()));
        }
        Ok(json!({
            "workflow_id": finished.id,
            "status": finished.status,
            "result": finished.result,
        }))
    }

    async fn run_memory(&self, task: &Task, options: &TaskOptions) -> Result<Value, ProviderError> {
        let params: MemoryParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| ProviderError::Failed(format!("Invalid memory task: {e}")))?;
        let namespace = params.namespace.clone().unwrap_or_else(|| {
            options
                .session_id
                .map_or_else(|| DEFAULT_NAMESPACE.to_string(), session_namespace)
        });
        run_memory_operation(&self.memory, &params, &namespace)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))
    }

    async fn run_analysis(&self, task: &Task) -> Result<Value, ProviderError> {
        let backend = self.quality.as_ref().ok_or_else(|| unavailable("quality metrics"))?;
        let params: AnalysisParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| ProviderError::Failed(format!("Invalid analysis task: {e}")))?;
        let report = backend
            .analyze(AnalysisRequest {
                target: params.target,
                analysis_type: params.analysis_type,
            })
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        serde_json::to_value(report).map_err(|e| ProviderError::Failed(e.to_string()))
    }

    async fn run_generation(&self, task: &Task) -> Result<Value, ProviderError> {
        let backend = self.text.as_ref().ok_or_else(|| unavailable("text generation"))?;
        let prompt = task
            .instruction
            .clone()
            .ok_or(ProviderError::MissingInstruction)?;
        let generation = backend
            .generate(GenerationRequest {
                task: task_label(task.kind).to_string(),
                prompt,
                model: task.payload.get("model").and_then(Value::as_str).map(str::to_string),
            })
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        serde_json::to_value(generation).map_err(|e| ProviderError::Failed(e.to_string()))
    }
}

fn unavailable(what: &str) -> ProviderError {
    ProviderError::Unavailable {
        provider: ProviderKind::Primary,
        reason: format!("no {what} backend configured"),
    }
}

const fn task_label(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::CodeGeneration => "code_generation",
        _ => "generation",
    }
}

#[async_trait]
impl Provider for EngineProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Primary
    }

    fn is_available(&self) -> bool {
        self.workflows.strong_count() > 0
    }

    async fn execute(
        &self,
        task: &Task,
        options: &TaskOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        let output = match task.kind {
            TaskKind::Workflow | TaskKind::Automation => self.run_workflow(task, options).await?,
            TaskKind::Memory => self.run_memory(task, options).await?,
            TaskKind::Analysis => self.run_analysis(task).await?,
            TaskKind::Generation | TaskKind::CodeGeneration => self.run_generation(task).await?,
            other => return Err(ProviderError::Unsupported(other)),
        };
        Ok(ProviderResponse::ok(ProviderKind::Primary, output))
    }
}

/// Text generation for `ai_task` steps, routed with fallback.
pub struct RoutedTextGeneration {
    router: Arc<ProviderRouter>,
}

impl RoutedTextGeneration {
    #[must_use]
    pub const fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl TextGeneration for RoutedTextGeneration {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, BackendError> {
        let kind = if request.task == "code_generation" {
            TaskKind::CodeGeneration
        } else {
            TaskKind::Generation
        };
        let task = Task::new(kind)
            .with_instruction(request.prompt)
            .with_payload(json!({ "task": request.task, "model": request.model }));

        let response = self
            .router
            .execute_hybrid_task(&task, &TaskOptions::default())
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        // The primary provider returns a full `Generation`; the others only text.
        if let Ok(generation) = serde_json::from_value::<Generation>(response.output.clone()) {
            return Ok(generation);
        }
        let text = ["text", "result", "message"]
            .iter()
            .find_map(|field| response.output.get(*field).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        Ok(Generation {
            provider: response.provider.to_string(),
            model: request.model,
            text,
            usage: TokenUsage::default(),
        })
    }
}

/// `custom` step handler that sends `args.instruction` to the external tool.
pub struct ExternalToolStep {
    tool: Arc<ExternalToolProvider>,
}

impl ExternalToolStep {
    #[must_use]
    pub const fn new(tool: Arc<ExternalToolProvider>) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl CustomStepHandler for ExternalToolStep {
    async fn run(&self, ctx: &StepContext, args: &Value) -> Result<Value, StepError> {
        let instruction = args
            .get("instruction")
            .and_then(Value::as_str)
            .ok_or(StepError::MissingParam("instruction"))?;
        let options = TaskOptions {
            session_id: ctx.session_id,
            ..TaskOptions::default()
        };
        let result = self
            .tool
            .run_instruction(instruction, &options)
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;
        Ok(json!({
            "provider": ProviderKind::ExternalTool,
            "instruction": instruction,
            "result": result,
        }))
    }
}
