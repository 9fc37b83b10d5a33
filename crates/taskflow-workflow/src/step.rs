//! Step dispatch.

use std::{
    collections::HashMap,
    future::Future,
    path::{Component, Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use taskflow_core::{DEFAULT_NAMESPACE, SessionId, WorkflowId};
use taskflow_memory::{MemoryStore, SearchOptions, SearchQuery};

use crate::{
    backend::{
        AnalysisRequest, Backends, DeployRequest, GenerationRequest, TestRequest,
    },
    definition::{
        AiTaskParams, AnalysisParams, CustomParams, DeployParams, FileOperation, FileParams,
        MemoryOperation, MemoryParams, Step, StepKind, TestParams,
    },
    error::StepError,
};

/// What a custom step handler may see of the running workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub session_id: Option<SessionId>,
    pub step_name: String,
    pub step_index: usize,
}

/// Handler for `custom` steps, registered on the engine by name.
#[async_trait]
pub trait CustomStepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext, args: &Value) -> Result<Value, StepError>;
}

/// Runs single steps against backends, the filesystem and memory.
pub struct StepExecutor {
    backends: Backends,
    handlers: RwLock<HashMap<String, Arc<dyn CustomStepHandler>>>,
    memory: Arc<MemoryStore>,
    working_dir: PathBuf,
    step_timeout: Option<Duration>,
}

impl StepExecutor {
    #[must_use]
    pub fn new(
        backends: Backends,
        memory: Arc<MemoryStore>,
        working_dir: PathBuf,
        step_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backends,
            handlers: RwLock::new(HashMap::new()),
            memory,
            working_dir,
            step_timeout,
        }
    }

    /// Register or replace a custom step handler.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn CustomStepHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    /// Execute one step.
    ///
    /// # Errors
    /// Returns the step's failure; the caller fails the workflow.
    pub async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<Value, StepError> {
        tracing::debug!(
            workflow_id = %ctx.workflow_id,
            step = %step.name,
            step_type = step.kind.type_name(),
            "executing step"
        );

        match &step.kind {
            StepKind::CodeAnalysis(p) => self.code_analysis(p).await,
            StepKind::FileOperation(p) => self.file_operation(p).await,
            StepKind::AiTask(p) => self.ai_task(p).await,
            StepKind::TestExecution(p) => self.test_execution(p).await,
            StepKind::Deployment(p) => self.deployment(p).await,
            StepKind::MemoryOperation(p) => self.memory_operation(ctx, p).await,
            StepKind::Custom(p) => self.custom(ctx, p).await,
        }
    }

    async fn code_analysis(&self, p: &AnalysisParams) -> Result<Value, StepError> {
        let backend = self
            .backends
            .quality
            .as_ref()
            .ok_or(StepError::MissingBackend("quality metrics"))?;
        let report = self
            .timed(backend.analyze(AnalysisRequest {
                target: p.target.clone(),
                analysis_type: p.analysis_type.clone(),
            }))
            .await?;

        Ok(json!({
            "target": p.target,
            "analysis_type": p.analysis_type,
            "issues": report.issues,
            "metrics": report.metrics,
            "suggestions": report.suggestions,
        }))
    }

    async fn ai_task(&self, p: &AiTaskParams) -> Result<Value, StepError> {
        let backend = self
            .backends
            .text
            .as_ref()
            .ok_or(StepError::MissingBackend("text generation"))?;
        let generation = self
            .timed(backend.generate(GenerationRequest {
                task: p.task.clone(),
                prompt: p.prompt.clone(),
                model: p.model.clone(),
            }))
            .await?;

        Ok(json!({
            "task": p.task,
            "prompt": p.prompt,
            "model": generation.model.or_else(|| p.model.clone()),
            "provider": generation.provider,
            "response": generation.text,
            "usage": generation.usage,
        }))
    }

    async fn test_execution(&self, p: &TestParams) -> Result<Value, StepError> {
        let backend = self
            .backends
            .tests
            .as_ref()
            .ok_or(StepError::MissingBackend("test runner"))?;
        let report = self
            .timed(backend.run(TestRequest {
                test_type: p.test_type.clone(),
                target: p.target.clone(),
            }))
            .await?;

        Ok(json!({
            "test_type": p.test_type,
            "target": p.target,
            "passed": report.passed,
            "total_tests": report.total_tests,
            "failed_tests": report.failed_tests,
            "coverage": report.coverage,
            "duration_ms": report.duration_ms,
        }))
    }

    async fn deployment(&self, p: &DeployParams) -> Result<Value, StepError> {
        let backend = self
            .backends
            .deploy
            .as_ref()
            .ok_or(StepError::MissingBackend("deploy target"))?;
        let deployment = self
            .timed(backend.deploy(DeployRequest {
                environment: p.environment.clone(),
                target: p.target.clone(),
            }))
            .await?;

        Ok(json!({
            "environment": p.environment,
            "target": p.target,
            "status": "success",
            "deployment_id": deployment.deployment_id,
            "url": deployment.url,
            "timestamp": Utc::now(),
        }))
    }

    async fn file_operation(&self, p: &FileParams) -> Result<Value, StepError> {
        let path = resolve_path(&self.working_dir, &p.path)?;
        let io = |source| StepError::Io {
            path: p.path.clone(),
            source,
        };

        match p.operation {
            FileOperation::Read => {
                let content = tokio::fs::read_to_string(&path).await.map_err(io)?;
                Ok(Value::String(content))
            }
            FileOperation::Write => {
                let content = p.content.as_deref().ok_or(StepError::MissingParam("content"))?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io)?;
                }
                tokio::fs::write(&path, content).await.map_err(io)?;
                Ok(json!({"success": true, "path": p.path}))
            }
            FileOperation::Exists => {
                let exists = tokio::fs::try_exists(&path).await.map_err(io)?;
                Ok(Value::Bool(exists))
            }
            FileOperation::List => {
                let mut entries = tokio::fs::read_dir(&path).await.map_err(io)?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await.map_err(io)? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(json!(names))
            }
        }
    }

    async fn memory_operation(&self, ctx: &StepContext, p: &MemoryParams) -> Result<Value, StepError> {
        let namespace = p.namespace.clone().unwrap_or_else(|| {
            ctx.session_id
                .map_or_else(|| DEFAULT_NAMESPACE.to_string(), taskflow_core::session_namespace)
        });

        run_memory_operation(&self.memory, p, &namespace).await
    }

    async fn custom(&self, ctx: &StepContext, p: &CustomParams) -> Result<Value, StepError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&p.handler)
            .cloned()
            .ok_or_else(|| StepError::UnknownHandler(p.handler.clone()))?;
        self.timed(handler.run(ctx, &p.args)).await
    }

    async fn timed<T, E, F>(&self, call: F) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepError>,
    {
        match self.step_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StepError::Timeout(limit))?
                .map_err(Into::into),
            None => call.await.map_err(Into::into),
        }
    }
}

/// Apply one memory operation in `namespace`.
///
/// # Errors
/// Returns error if `store` has no data or the memory store fails.
pub async fn run_memory_operation(
    memory: &MemoryStore,
    p: &MemoryParams,
    namespace: &str,
) -> Result<Value, StepError> {
    match p.operation {
        MemoryOperation::Store => {
            let data = p.data.as_ref().ok_or(StepError::MissingParam("data"))?;
            let id = memory.store(&p.key, data, namespace).await?;
            Ok(json!({"id": id, "namespace": namespace, "key": p.key}))
        }
        MemoryOperation::Retrieve => Ok(memory
            .retrieve(&p.key, namespace)
            .await?
            .unwrap_or(Value::Null)),
        MemoryOperation::Search => {
            let hits = memory.search(
                &SearchQuery::from(p.key.as_str()),
                &SearchOptions::default().in_namespace(namespace),
            );
            Ok(serde_json::to_value(hits)?)
        }
        MemoryOperation::Delete => {
            let deleted = memory.delete(&p.key, namespace).await?;
            Ok(Value::Bool(deleted))
        }
    }
}

/// Join a relative step path onto the working directory.
fn resolve_path(working_dir: &Path, raw: &str) -> Result<PathBuf, StepError> {
    let relative = Path::new(raw);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(StepError::PathEscape(raw.to_string()));
    }
    Ok(working_dir.join(relative))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use taskflow_core::EventBus;
    use taskflow_memory::{InMemoryBlobStorage, MemoryConfig};
    use tempfile::TempDir;
    use tokio_test::assert_err;
    use uuid::Uuid;

    use super::*;
    use crate::backend::{BackendError, Generation, TextGeneration, TokenUsage};

    struct EchoText;

    #[async_trait]
    impl TextGeneration for EchoText {
        async fn generate(&self, request: GenerationRequest) -> Result<Generation, BackendError> {
            Ok(Generation {
                provider: "echo".into(),
                model: None,
                text: request.prompt.to_uppercase(),
                usage: TokenUsage {
                    input_tokens: 3,
                    output_tokens: 5,
                },
            })
        }
    }

    struct SlowText;

    #[async_trait]
    impl TextGeneration for SlowText {
        async fn generate(&self, _: GenerationRequest) -> Result<Generation, BackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(BackendError::Failed("unreachable".into()))
        }
    }

    struct Counter(AtomicUsize);

    #[async_trait]
    impl CustomStepHandler for Counter {
        async fn run(&self, ctx: &StepContext, args: &Value) -> Result<Value, StepError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"step": ctx.step_name, "n": n, "args": args}))
        }
    }

    async fn executor(backends: Backends, dir: &Path, timeout: Option<Duration>) -> StepExecutor {
        let memory = MemoryStore::open(
            Arc::new(InMemoryBlobStorage::new()),
            MemoryConfig::write_through(),
            Arc::new(EventBus::new()),
        )
        .await
        .unwrap();
        StepExecutor::new(backends, memory, dir.to_path_buf(), timeout)
    }

    fn ctx(session_id: Option<SessionId>) -> StepContext {
        StepContext {
            workflow_id: Uuid::new_v4(),
            workflow_name: "test".into(),
            session_id,
            step_name: "step".into(),
            step_index: 0,
        }
    }

    fn file_step(operation: FileOperation, path: &str, content: Option<&str>) -> Step {
        Step::new(
            "file",
            StepKind::FileOperation(FileParams {
                operation,
                path: path.into(),
                content: content.map(str::to_string),
            }),
        )
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default(), dir.path(), None).await;
        let cx = ctx(None);

        let written = exec
            .execute(&cx, &file_step(FileOperation::Write, "out/page.html", Some("<h1>hi</h1>")))
            .await
            .unwrap();
        assert_eq!(written["success"], true);

        let read = exec.execute(&cx, &file_step(FileOperation::Read, "out/page.html", None)).await;
        assert_eq!(read.unwrap(), json!("<h1>hi</h1>"));

        let exists = exec.execute(&cx, &file_step(FileOperation::Exists, "out/none", None)).await;
        assert_eq!(exists.unwrap(), json!(false));

        let listed = exec.execute(&cx, &file_step(FileOperation::List, "out", None)).await;
        assert_eq!(listed.unwrap(), json!(["page.html"]));

        let err = assert_err!(exec.execute(&cx, &file_step(FileOperation::Read, "../etc", None)).await);
        assert!(matches!(err, StepError::PathEscape(_)));

        let err = assert_err!(exec.execute(&cx, &file_step(FileOperation::Write, "x", None)).await);
        assert!(matches!(err, StepError::MissingParam("content")));
    }

    #[tokio::test]
    async fn test_ai_task_reports_provider_and_usage() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default().with_text(Arc::new(EchoText)), dir.path(), None).await;
        let step = Step::new(
            "report",
            StepKind::AiTask(AiTaskParams {
                task: "report".into(),
                prompt: "hello".into(),
                model: Some("m1".into()),
            }),
        );

        let value = exec.execute(&ctx(None), &step).await.unwrap();
        assert_eq!(value["provider"], "echo");
        assert_eq!(value["response"], "HELLO");
        assert_eq!(value["model"], "m1");
        assert_eq!(value["usage"]["output_tokens"], 5);
    }

    #[tokio::test]
    async fn test_missing_backend_fails() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default(), dir.path(), None).await;
        let step = Step::new(
            "deploy",
            StepKind::Deployment(DeployParams {
                environment: "staging".into(),
                target: "site".into(),
            }),
        );
        let err = assert_err!(exec.execute(&ctx(None), &step).await);
        assert!(matches!(err, StepError::MissingBackend(_)));
    }

    #[tokio::test]
    async fn test_backend_call_times_out() {
        let dir = TempDir::new().unwrap();
        let exec = executor(
            Backends::default().with_text(Arc::new(SlowText)),
            dir.path(),
            Some(Duration::from_millis(20)),
        )
        .await;
        let step = Step::new(
            "slow",
            StepKind::AiTask(AiTaskParams {
                task: "t".into(),
                prompt: "p".into(),
                model: None,
            }),
        );
        let err = assert_err!(exec.execute(&ctx(None), &step).await);
        assert!(matches!(err, StepError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_memory_operations_default_to_session_namespace() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default(), dir.path(), None).await;
        let session_id = Uuid::new_v4();
        let cx = ctx(Some(session_id));
        let op = |operation, data: Option<Value>| {
            Step::new(
                "mem",
                StepKind::MemoryOperation(MemoryParams {
                    operation,
                    key: "city".into(),
                    data,
                    namespace: None,
                }),
            )
        };

        exec.execute(&cx, &op(MemoryOperation::Store, Some(json!("Bergamo")))).await.unwrap();
        assert_eq!(
            exec.memory.keys(&taskflow_core::session_namespace(session_id)),
            vec!["city"]
        );

        let value = exec.execute(&cx, &op(MemoryOperation::Retrieve, None)).await.unwrap();
        assert_eq!(value, json!("Bergamo"));

        let hits = exec.execute(&cx, &op(MemoryOperation::Search, None)).await.unwrap();
        assert_eq!(hits.as_array().map(Vec::len), Some(1));

        let deleted = exec.execute(&cx, &op(MemoryOperation::Delete, None)).await.unwrap();
        assert_eq!(deleted, json!(true));
        let value = exec.execute(&cx, &op(MemoryOperation::Retrieve, None)).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_search_output_is_hit_list() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default(), dir.path(), None).await;
        exec.memory.store("city", &json!("Como"), "places").await.unwrap();

        let params = MemoryParams {
            operation: MemoryOperation::Search,
            key: "city".into(),
            data: None,
            namespace: None,
        };
        let hits = run_memory_operation(&exec.memory, &params, "places").await.unwrap();
        let hits = hits.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["key"], "city");
        assert_eq!(hits[0]["namespace"], "places");

        let none = run_memory_operation(&exec.memory, &params, "elsewhere").await.unwrap();
        assert_eq!(none, json!([]));
    }

    #[test]
    fn test_unserializable_output_is_step_failure() {
        use taskflow_core::Classify;

        let err = StepError::from(serde_json::from_str::<Value>("{").unwrap_err());
        assert!(matches!(err, StepError::Output(_)));
        assert_eq!(err.kind(), taskflow_core::ErrorKind::ExecutionFailure);
    }

    #[tokio::test]
    async fn test_custom_handler_dispatch() {
        let dir = TempDir::new().unwrap();
        let exec = executor(Backends::default(), dir.path(), None).await;
        exec.register_handler("count", Arc::new(Counter(AtomicUsize::new(0))));

        let step = |handler: &str| {
            Step::new(
                "hook",
                StepKind::Custom(CustomParams {
                    handler: handler.into(),
                    args: json!({"x": 1}),
                }),
            )
        };

        let value = exec.execute(&ctx(None), &step("count")).await.unwrap();
        assert_eq!(value, json!({"step": "step", "n": 1, "args": {"x": 1}}));

        let err = assert_err!(exec.execute(&ctx(None), &step("missing")).await);
        assert!(matches!(err, StepError::UnknownHandler(_)));
    }
}
