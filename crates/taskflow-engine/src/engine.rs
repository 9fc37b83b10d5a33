//! The `Engine` facade.
//!
//! Owns every component, wires the router's primary provider to the workflow
//! engine and keeps engine-level metrics and state in the `system` namespace.

use std::sync::{
    Arc, Mutex, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use taskflow_core::{
    BlobStorage, CheckpointId, EventBus, PeriodicTask, SYSTEM_NAMESPACE, SessionId, WorkflowId,
};
use taskflow_memory::{
    FsBlobStorage, InMemoryBlobStorage, MemoryConfig, MemoryStats, MemoryStore, SearchHit,
    SearchOptions, SearchQuery,
};
use taskflow_router::{
    ExternalToolConfig, ExternalToolProvider, Provider, ProviderResponse, ProviderRouter,
    RouterStatus, StaticProvider, Task, TaskOptions,
};
use taskflow_session::{Checkpoint, Session, SessionManager, SessionOptions};
use taskflow_workflow::{
    Backends, CatalogEntry, CustomParams, CustomStepHandler, DeployTarget, ExecuteOptions,
    QualityMetrics, Step, StepKind, TestRunner, TextGeneration, Workflow, WorkflowDefinition,
    WorkflowEngine, WorkflowError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{EngineConfig, StorageBackend},
    error::{EngineError, Result},
    metrics::{EngineMetrics, MetricsSnapshot, spawn_listener},
    provider::{EXTERNAL_TOOL_HANDLER, EngineProvider, ExternalToolStep, RoutedTextGeneration},
};

/// Engine version recorded in saved state.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const STATE_KEY: &str = "engine/state";

/// Snapshot saved to `system/engine/state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub active_workflows: Vec<WorkflowId>,
    pub metrics: MetricsSnapshot,
    pub uptime_ms: i64,
}

/// Aggregate status returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: i64,
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub active_workflows: usize,
    pub total_workflows: usize,
    pub registered_workflows: usize,
    pub metrics: MetricsSnapshot,
    pub memory: MemoryStats,
    pub router: RouterStatus,
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn BlobStorage>>,
    quality: Option<Arc<dyn QualityMetrics>>,
    text: Option<Arc<dyn TextGeneration>>,
    tests: Option<Arc<dyn TestRunner>>,
    deploy: Option<Arc<dyn DeployTarget>>,
    handlers: Vec<(String, Arc<dyn CustomStepHandler>)>,
    static_provider: Option<StaticProvider>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use this durable storage instead of the configured backend.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn BlobStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn with_quality_metrics(mut self, backend: Arc<dyn QualityMetrics>) -> Self {
        self.quality = Some(backend);
        self
    }

    /// Text backend used by the primary provider.
    #[must_use]
    pub fn with_text_generation(mut self, backend: Arc<dyn TextGeneration>) -> Self {
        self.text = Some(backend);
        self
    }

    #[must_use]
    pub fn with_test_runner(mut self, backend: Arc<dyn TestRunner>) -> Self {
        self.tests = Some(backend);
        self
    }

    #[must_use]
    pub fn with_deploy_target(mut self, backend: Arc<dyn DeployTarget>) -> Self {
        self.deploy = Some(backend);
        self
    }

    #[must_use]
    pub fn with_step_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn CustomStepHandler>,
    ) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    #[must_use]
    pub fn with_static_provider(mut self, provider: StaticProvider) -> Self {
        self.static_provider = Some(provider);
        self
    }

    /// Open storage, load persisted sessions and definitions, probe the
    /// external tool and start background tasks.
    ///
    /// # Errors
    /// Returns error if storage cannot be opened or loaded.
    pub async fn build(self) -> Result<Arc<Engine>> {
        let config = self.config;
        let events = Arc::new(EventBus::with_history(config.engine.event_history));

        let storage: Arc<dyn BlobStorage> = match self.storage {
            Some(storage) => storage,
            None => match config.storage.backend {
                StorageBackend::Memory => Arc::new(InMemoryBlobStorage::new()),
                StorageBackend::Fs => Arc::new(FsBlobStorage::open(&config.storage.path).await?),
            },
        };
        let memory = MemoryStore::open(
            storage,
            MemoryConfig::from(&config.memory),
            Arc::clone(&events),
        )
        .await?;

        let sessions = SessionManager::new(
            (&config.session).into(),
            Arc::clone(&memory),
            Arc::clone(&events),
        );
        let restored = sessions.load_sessions().await?;

        let router = Arc::new(ProviderRouter::new(config.router.clone()));
        router.register(Arc::new(self.static_provider.unwrap_or_default()));

        let external = if config.external_tool.enabled {
            let tool = Arc::new(ExternalToolProvider::new(ExternalToolConfig::from(
                &config.external_tool,
            )));
            tool.probe().await;
            router.register(tool.clone());
            Some(tool)
        } else {
            None
        };

        let backends = Backends {
            quality: self.quality.clone(),
            text: Some(Arc::new(RoutedTextGeneration::new(Arc::clone(&router)))),
            tests: self.tests,
            deploy: self.deploy,
        };
        let workflows = WorkflowEngine::new(
            (&config.workflow).into(),
            backends,
            Arc::clone(&memory),
            Some(Arc::clone(&sessions)),
            Arc::clone(&events),
        );
        let loaded = workflows.load_definitions().await?;
        for (name, handler) in self.handlers {
            workflows.register_step_handler(name, handler);
        }
        if let Some(tool) = &external {
            workflows.register_step_handler(
                EXTERNAL_TOOL_HANDLER,
                Arc::new(ExternalToolStep::new(Arc::clone(tool))),
            );
        }

        router.register(Arc::new(EngineProvider::new(
            Arc::downgrade(&workflows),
            Arc::clone(&memory),
            self.quality,
            self.text,
        )));

        let metrics = Arc::new(EngineMetrics::default());
        let token = CancellationToken::new();
        let listener = spawn_listener(&events, Arc::clone(&metrics), Arc::clone(&memory), token.clone());

        let interval = config.state_save_interval();
        let engine = Arc::new_cyclic(|this: &Weak<Engine>| {
            let this = this.clone();
            let saver = PeriodicTask::spawn("engine-state", interval, move || {
                let this = this.clone();
                async move {
                    if let Some(engine) = this.upgrade() {
                        if let Err(e) = engine.save_state().await {
                            warn!("failed to save engine state: {e}");
                        }
                    }
                }
            });

            Engine {
                config,
                started_at: Utc::now(),
                events,
                memory,
                sessions,
                workflows,
                router,
                external,
                metrics,
                state_saver: Mutex::new(Some(saver)),
                listener: Mutex::new(Some((token, listener))),
                shut_down: AtomicBool::new(false),
            }
        });

        match engine.load_state().await {
            Ok(Some(state)) => info!(saved_at = %state.timestamp, "restored engine metrics"),
            Ok(None) => {}
            Err(e) => warn!("failed to load engine state: {e}"),
        }

        info!(
            sessions = restored,
            definitions = loaded,
            providers = ?engine.router.registered(),
            "engine started"
        );
        Ok(engine)
    }
}

/// Orchestration engine facade.
pub struct Engine {
    config: EngineConfig,
    started_at: DateTime<Utc>,
    events: Arc<EventBus>,
    memory: Arc<MemoryStore>,
    sessions: Arc<SessionManager>,
    workflows: Arc<WorkflowEngine>,
    router: Arc<ProviderRouter>,
    external: Option<Arc<ExternalToolProvider>>,
    metrics: Arc<EngineMetrics>,
    state_saver: Mutex<Option<PeriodicTask>>,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

impl Engine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub fn memory(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.memory)
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    #[must_use]
    pub fn workflows(&self) -> Arc<WorkflowEngine> {
        Arc::clone(&self.workflows)
    }

    #[must_use]
    pub fn router(&self) -> Arc<ProviderRouter> {
        Arc::clone(&self.router)
    }

    // Sessions

    pub async fn create_session(&self, options: SessionOptions) -> Result<Session> {
        Ok(self.sessions.create_session(options).await?)
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.get_session(id).await?)
    }

    pub async fn end_session(&self, id: SessionId) -> Result<Session> {
        Ok(self.sessions.end_session(id).await?)
    }

    pub async fn create_checkpoint(&self, id: SessionId, description: &str) -> Result<Checkpoint> {
        Ok(self.sessions.create_checkpoint(id, description).await?)
    }

    pub async fn list_checkpoints(&self, id: SessionId) -> Result<Vec<Checkpoint>> {
        Ok(self.sessions.list_checkpoints(id).await?)
    }

    pub async fn restore_checkpoint(
        &self,
        id: SessionId,
        checkpoint_id: CheckpointId,
    ) -> Result<Session> {
        Ok(self.sessions.restore_checkpoint(id, checkpoint_id).await?)
    }

    /// End every expired session.
    pub async fn cleanup_old_sessions(&self) -> Vec<SessionId> {
        self.sessions.cleanup_old_sessions().await
    }

    // Workflows

    pub fn register_workflow(&self, name: impl Into<String>, definition: WorkflowDefinition) {
        self.workflows.register_workflow(name, definition);
    }

    #[must_use]
    pub fn list_workflows(&self) -> Vec<CatalogEntry> {
        self.workflows.list_workflows()
    }

    /// Start a workflow, optionally bound to a session.
    ///
    /// # Errors
    /// `Unregistered`, `NotFound` (session) or `CapacityExceeded`.
    pub async fn execute_workflow(
        &self,
        name: &str,
        session_id: Option<SessionId>,
    ) -> Result<Workflow> {
        Ok(self
            .workflows
            .execute_workflow(name, ExecuteOptions { session_id })
            .await?)
    }

    /// Current state of a workflow.
    ///
    /// # Errors
    /// `NotFound` for an unknown id.
    pub fn workflow_status(&self, id: WorkflowId) -> Result<Workflow> {
        self.workflows
            .get_workflow(id)
            .ok_or_else(|| WorkflowError::NotFound(id).into())
    }

    pub async fn wait_for_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        Ok(self.workflows.wait_for(id).await?)
    }

    /// Register a one-step workflow that sends `instruction` to the external
    /// tool.
    ///
    /// # Errors
    /// `ExternalToolUnavailable` if the tool is disabled or was not found.
    pub fn register_external_tool_workflow(&self, name: &str, instruction: &str) -> Result<()> {
        let available = self
            .external
            .as_ref()
            .is_some_and(|tool| tool.is_available());
        if !available {
            return Err(EngineError::ExternalToolUnavailable);
        }

        let definition = WorkflowDefinition::new(
            name,
            format!("External tool: {instruction}"),
            vec![Step::new(
                "external_tool",
                StepKind::Custom(CustomParams {
                    handler: EXTERNAL_TOOL_HANDLER.to_string(),
                    args: json!({ "instruction": instruction }),
                }),
            )],
        );
        self.workflows.register_workflow(name, definition);
        info!(workflow = %name, "registered external tool workflow");
        Ok(())
    }

    // Memory

    pub async fn store_memory<T>(&self, key: &str, value: &T, namespace: &str) -> Result<Uuid>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.memory.store(key, value, namespace).await?)
    }

    pub async fn retrieve_memory(&self, key: &str, namespace: &str) -> Result<Option<Value>> {
        Ok(self.memory.retrieve(key, namespace).await?)
    }

    #[must_use]
    pub fn search_memory(&self, query: &SearchQuery, options: &SearchOptions) -> Vec<SearchHit> {
        self.memory.search(query, options)
    }

    pub async fn delete_memory(&self, key: &str, namespace: &str) -> Result<bool> {
        Ok(self.memory.delete(key, namespace).await?)
    }

    // Routing

    /// Route a task through the provider chain.
    ///
    /// # Errors
    /// `ProviderUnavailable` if every provider fails.
    pub async fn execute_hybrid_task(
        &self,
        task: &Task,
        options: &TaskOptions,
    ) -> Result<ProviderResponse> {
        Ok(self.router.execute_hybrid_task(task, options).await?)
    }

    // State

    /// Write the engine state to `system/engine/state`.
    ///
    /// # Errors
    /// Returns error if the state cannot be stored.
    pub async fn save_state(&self) -> Result<EngineState> {
        let state = EngineState {
            version: ENGINE_VERSION.to_string(),
            timestamp: Utc::now(),
            active_workflows: self.workflows.active_workflows().iter().map(|w| w.id).collect(),
            metrics: self.metrics.snapshot(),
            uptime_ms: self.uptime_ms(),
        };
        self.memory.store(STATE_KEY, &state, SYSTEM_NAMESPACE).await?;
        tracing::debug!(uptime_ms = state.uptime_ms, "engine state saved");
        Ok(state)
    }

    /// Read the saved engine state and restore its metrics.
    ///
    /// # Errors
    /// Returns error if the stored state cannot be read or decoded.
    pub async fn load_state(&self) -> Result<Option<EngineState>> {
        let state: Option<EngineState> = self.memory.retrieve_as(STATE_KEY, SYSTEM_NAMESPACE).await?;
        if let Some(state) = &state {
            self.metrics.restore(state.metrics);
        }
        Ok(state)
    }

    fn uptime_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn status(&self) -> EngineStatus {
        let sessions = self.sessions.sessions().await;
        let active_sessions = sessions.iter().filter(|s| s.is_active()).count();
        EngineStatus {
            version: ENGINE_VERSION,
            started_at: self.started_at,
            uptime_ms: self.uptime_ms(),
            active_sessions,
            total_sessions: sessions.len(),
            active_workflows: self.workflows.active_workflows().len(),
            total_workflows: self.workflows.workflows().len(),
            registered_workflows: self.workflows.list_workflows().len(),
            metrics: self.metrics.snapshot(),
            memory: self.memory.stats(),
            router: self.router.status(),
        }
    }

    /// Stop the engine.
    ///
    /// Saves state, cancels running workflows, ends active sessions with a
    /// final checkpoint, stops background tasks and flushes memory. Later
    /// calls do nothing.
    ///
    /// # Errors
    /// Returns error if the final memory flush fails.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("engine shutting down");

        if let Err(e) = self.save_state().await {
            warn!("failed to save engine state: {e}");
        }
        let cancelled = self.workflows.shutdown();
        let ended = self.sessions.shutdown().await;

        let saver = self
            .state_saver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(saver) = saver {
            saver.stop().await;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = listener {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("metrics listener panicked: {e}");
            }
        }

        self.memory.shutdown().await?;
        info!(cancelled, ended, "engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use serde_json::json;
    use taskflow_core::{Classify, ErrorKind, FlowEvent, SessionStatus, WorkflowStatus, session_namespace};
    use taskflow_router::{ProviderKind, TaskKind};
    use taskflow_session::FINAL_CHECKPOINT;
    use taskflow_workflow::{
        AiTaskParams, MemoryOperation, MemoryParams, StepContext, StepError,
    };
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    async fn ephemeral() -> Arc<Engine> {
        Engine::builder(EngineConfig::ephemeral()).build().await.unwrap()
    }

    fn remember(key: &str, data: Value) -> Step {
        Step::new(
            key,
            StepKind::MemoryOperation(MemoryParams {
                operation: MemoryOperation::Store,
                key: key.to_string(),
                data: Some(data),
                namespace: None,
            }),
        )
    }

    /// Wait until the metrics listener has seen `expected`.
    async fn settle(engine: &Engine, expected: impl Fn(MetricsSnapshot) -> bool) {
        for _ in 0..100 {
            if expected(engine.metrics()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("metrics never settled: {:?}", engine.metrics());
    }

    #[tokio::test]
    async fn test_session_bound_workflow_end_to_end() {
        let engine = ephemeral().await;
        engine.register_workflow(
            "remember",
            WorkflowDefinition::new(
                "remember",
                "stores two facts",
                vec![remember("a", json!(1)), remember("b", json!({"x": true}))],
            ),
        );

        let session = engine
            .create_session(SessionOptions::named("e2e"))
            .await
            .unwrap();
        let started = engine
            .execute_workflow("remember", Some(session.id))
            .await
            .unwrap();
        assert_eq!(started.status, WorkflowStatus::Running);

        let finished = engine.wait_for_workflow(started.id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.progress, 100);

        let namespace = session_namespace(session.id);
        assert_eq!(engine.retrieve_memory("a", &namespace).await.unwrap(), Some(json!(1)));

        let session = engine.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.stats.workflows_executed, 1);
        assert_eq!(session.workflows[0].id, finished.id);

        settle(&engine, |m| m.sessions_created == 1 && m.workflows_executed == 1).await;
        let status = engine.status().await;
        assert_eq!(status.active_sessions, 1);
        assert_eq!(status.total_workflows, 1);
        assert_eq!(status.active_workflows, 0);
        assert!(status.registered_workflows >= 5);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_rejections_are_classified() {
        let engine = ephemeral().await;

        let err = engine.execute_workflow("nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unregistered);

        let err = engine
            .execute_workflow("code_analysis", Some(SessionId::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = engine.workflow_status(WorkflowId::new_v4()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_ai_task_without_backend_falls_back_to_static() {
        let engine = ephemeral().await;
        engine.register_workflow(
            "ask",
            WorkflowDefinition::new(
                "ask",
                "",
                vec![Step::new(
                    "ask",
                    StepKind::AiTask(AiTaskParams {
                        task: "summary".into(),
                        prompt: "summarize the repo".into(),
                        model: None,
                    }),
                )],
            ),
        );

        let started = engine.execute_workflow("ask", None).await.unwrap();
        let finished = engine.wait_for_workflow(started.id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.steps[0].value["provider"], "static");

        let stats = engine.router().stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.provider_calls[&ProviderKind::Primary], 1);
    }

    #[tokio::test]
    async fn test_hybrid_task_routing() {
        let engine = ephemeral().await;

        let memory_task = Task::new(TaskKind::Memory).with_payload(json!({
            "operation": "store",
            "key": "k",
            "data": "v"
        }));
        let response = engine
            .execute_hybrid_task(&memory_task, &TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderKind::Primary);
        assert_eq!(
            engine.retrieve_memory("k", "default").await.unwrap(),
            Some(json!("v"))
        );

        let greeting = engine
            .execute_hybrid_task(&Task::new(TaskKind::Greeting), &TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(greeting.provider, ProviderKind::Static);

        let status = engine.status().await;
        assert_eq!(status.router.stats.hybrid_calls, 2);
        assert!(!status.router.external_tool_available);
    }

    #[tokio::test]
    async fn test_external_tool_workflow_requires_tool() {
        let engine = ephemeral().await;
        let err = engine
            .register_external_tool_workflow("refactor", "refactor the parser")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(!engine.list_workflows().iter().any(|w| w.id == "refactor"));
    }

    #[tokio::test]
    async fn test_custom_handlers_from_builder() {
        struct Upper;

        #[async_trait::async_trait]
        impl CustomStepHandler for Upper {
            async fn run(&self, _ctx: &StepContext, args: &Value) -> std::result::Result<Value, StepError> {
                let text = args["text"].as_str().ok_or(StepError::MissingParam("text"))?;
                Ok(json!(text.to_uppercase()))
            }
        }

        let engine = Engine::builder(EngineConfig::ephemeral())
            .with_step_handler("upper", Arc::new(Upper))
            .build()
            .await
            .unwrap();
        engine.register_workflow(
            "shout",
            WorkflowDefinition::new(
                "shout",
                "",
                vec![Step::new(
                    "upper",
                    StepKind::Custom(CustomParams {
                        handler: "upper".into(),
                        args: json!({"text": "hi"}),
                    }),
                )],
            ),
        );

        let started = engine.execute_workflow("shout", None).await.unwrap();
        let finished = engine.wait_for_workflow(started.id).await.unwrap();
        assert_eq!(finished.steps[0].value, json!("HI"));
    }

    #[tokio::test]
    async fn test_failed_workflow_is_logged_to_system() {
        let engine = ephemeral().await;
        engine.register_workflow(
            "broken",
            WorkflowDefinition::new(
                "broken",
                "",
                vec![Step::new(
                    "missing",
                    StepKind::Custom(CustomParams {
                        handler: "does-not-exist".into(),
                        args: Value::Null,
                    }),
                )],
            ),
        );

        let started = engine.execute_workflow("broken", None).await.unwrap();
        let finished = engine.wait_for_workflow(started.id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Failed);

        settle(&engine, |m| m.errors == 1).await;
        for _ in 0..100 {
            if engine.memory().keys(SYSTEM_NAMESPACE).iter().any(|k| k.starts_with("errors/")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("failure was not recorded in the system namespace");
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let storage: Arc<dyn BlobStorage> = Arc::new(InMemoryBlobStorage::new());

        let first = Engine::builder(EngineConfig::ephemeral())
            .with_storage(Arc::clone(&storage))
            .build()
            .await
            .unwrap();
        assert!(assert_ok!(first.load_state().await).is_none());
        first
            .create_session(SessionOptions::named("one"))
            .await
            .unwrap();
        settle(&first, |m| m.sessions_created == 1).await;
        first.shutdown().await.unwrap();

        let second = Engine::builder(EngineConfig::ephemeral())
            .with_storage(storage)
            .build()
            .await
            .unwrap();
        assert_eq!(second.metrics().sessions_created, 1);
        let state = second.load_state().await.unwrap().unwrap();
        assert_eq!(state.version, ENGINE_VERSION);
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions_and_cancels_workflows() {
        struct Hang;

        #[async_trait::async_trait]
        impl CustomStepHandler for Hang {
            async fn run(&self, _ctx: &StepContext, _args: &Value) -> std::result::Result<Value, StepError> {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        }

        let engine = Engine::builder(EngineConfig::ephemeral())
            .with_step_handler("hang", Arc::new(Hang))
            .build()
            .await
            .unwrap();
        engine.register_workflow(
            "hang",
            WorkflowDefinition::new(
                "hang",
                "",
                vec![Step::new(
                    "hang",
                    StepKind::Custom(CustomParams {
                        handler: "hang".into(),
                        args: Value::Null,
                    }),
                )],
            ),
        );
        let session = engine.create_session(SessionOptions::default()).await.unwrap();
        let workflow = engine.execute_workflow("hang", Some(session.id)).await.unwrap();
        let mut rx = engine.events().subscribe();

        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();

        assert_eq!(
            engine.workflow_status(workflow.id).unwrap().status,
            WorkflowStatus::Cancelled
        );
        let session = engine.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(
            session.latest_checkpoint().map(|c| c.description.as_str()),
            Some(FINAL_CHECKPOINT)
        );
        assert!(!engine.sessions().has_checkpoint_timer(session.id));

        let mut seen = BTreeMap::new();
        while let Ok(event) = rx.try_recv() {
            let name = match event {
                FlowEvent::WorkflowCancelled { .. } => "cancelled",
                FlowEvent::SessionEnded { .. } => "ended",
                _ => continue,
            };
            *seen.entry(name).or_insert(0) += 1;
        }
        assert_eq!(seen.get("cancelled"), Some(&1));
        assert_eq!(seen.get("ended"), Some(&1));

        assert_err!(engine.execute_workflow("hang", None).await);
    }

    #[tokio::test]
    async fn test_fs_storage_persists_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::ephemeral();
        config.storage.backend = StorageBackend::Fs;
        config.storage.path = dir.path().join("memory");

        let engine = Engine::builder(config.clone()).build().await.unwrap();
        engine.store_memory("note", "kept", "default").await.unwrap();
        engine.shutdown().await.unwrap();

        let reopened = Engine::builder(config).build().await.unwrap();
        assert_eq!(
            reopened.retrieve_memory("note", "default").await.unwrap(),
            Some(json!("kept"))
        );
        reopened.shutdown().await.unwrap();
    }
}
