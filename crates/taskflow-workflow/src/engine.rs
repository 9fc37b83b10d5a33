//! Workflow engine: admission, background execution and lifecycle events.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use taskflow_core::{
    EventBus, FlowEvent, SessionId, WorkflowId, WorkflowStatus, error::error_chain,
    session_namespace,
};
use taskflow_memory::MemoryStore;
use taskflow_session::SessionManager;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{
    backend::Backends,
    catalog::{CatalogEntry, WorkflowCatalog},
    definition::WorkflowDefinition,
    error::{StepError, WorkflowError},
    step::{CustomStepHandler, StepContext, StepExecutor},
    workflow::{StepRecord, Workflow, WorkflowFailure, progress},
};

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Running workflows beyond this are rejected, not queued.
    pub max_concurrent_workflows: usize,
    /// Limit on each backend or custom handler call.
    pub step_timeout: Option<Duration>,
    /// Root for `file_operation` paths.
    pub working_dir: PathBuf,
    /// Directory of JSON workflow definitions.
    pub workflows_path: Option<PathBuf>,
    /// How long finished workflows stay queryable before being pruned.
    pub retention: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 5,
            step_timeout: None,
            working_dir: PathBuf::from("."),
            workflows_path: None,
            retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Options for `execute_workflow`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Session to bind the workflow to.
    pub session_id: Option<SessionId>,
}

impl ExecuteOptions {
    #[must_use]
    pub const fn in_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
        }
    }
}

/// Executes catalog workflows in background tasks.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    catalog: WorkflowCatalog,
    steps: StepExecutor,
    memory: Arc<MemoryStore>,
    sessions: Option<Arc<SessionManager>>,
    events: Arc<EventBus>,
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    /// Active set: workflows whose run loop is still in flight.
    running: Mutex<HashMap<WorkflowId, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkflowEngine {
    /// Create an engine with the built-in workflows registered.
    #[must_use]
    pub fn new(
        config: WorkflowConfig,
        backends: Backends,
        memory: Arc<MemoryStore>,
        sessions: Option<Arc<SessionManager>>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let steps = StepExecutor::new(
            backends,
            Arc::clone(&memory),
            config.working_dir.clone(),
            config.step_timeout,
        );
        Arc::new(Self {
            config,
            catalog: WorkflowCatalog::with_builtins(),
            steps,
            memory,
            sessions,
            events,
            workflows: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Load definitions from the configured directory, if any.
    ///
    /// # Errors
    /// Returns error if the directory exists but cannot be read.
    pub async fn load_definitions(&self) -> Result<usize, WorkflowError> {
        match &self.config.workflows_path {
            Some(dir) => Ok(self.catalog.load_dir(dir).await?),
            None => Ok(0),
        }
    }

    /// Register or replace a workflow definition.
    pub fn register_workflow(&self, name: impl Into<String>, definition: WorkflowDefinition) {
        self.catalog.register(name, definition);
    }

    /// Register a handler for `custom` steps.
    pub fn register_step_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CustomStepHandler>,
    ) {
        self.steps.register_handler(name, handler);
    }

    #[must_use]
    pub fn list_workflows(&self) -> Vec<CatalogEntry> {
        self.catalog.list()
    }

    /// Start a workflow and return it in `running` state.
    ///
    /// Steps execute in a background task.
    ///
    /// # Errors
    /// `Unregistered` for an unknown name, `SessionNotFound` for an unknown
    /// session, `CapacityExceeded` when the concurrency cap is reached.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        name: &str,
        options: ExecuteOptions,
    ) -> Result<Workflow, WorkflowError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkflowError::ShutDown);
        }

        let definition = self
            .catalog
            .get(name)
            .ok_or_else(|| WorkflowError::Unregistered(name.to_string()))?;

        if let (Some(session_id), Some(sessions)) = (options.session_id, &self.sessions) {
            if sessions.get_session(session_id).await?.is_none() {
                return Err(WorkflowError::SessionNotFound(session_id));
            }
        }

        self.prune_finished(self.config.retention);

        let workflow = Workflow::new(name, definition, options.session_id);
        let id = workflow.id;
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            let max = self.config.max_concurrent_workflows;
            if running.len() >= max {
                tracing::warn!(workflow = %name, max, "workflow rejected at capacity");
                return Err(WorkflowError::CapacityExceeded { max });
            }

            self.workflows
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, workflow.clone());
            self.events.publish(FlowEvent::WorkflowStarted {
                workflow_id: id,
                name: name.to_string(),
                session_id: options.session_id,
            });

            let engine = Arc::clone(self);
            running.insert(id, tokio::spawn(async move { engine.run(id).await }));
        }

        tracing::info!(
            workflow_id = %id,
            workflow = %name,
            session_id = ?options.session_id,
            "workflow started"
        );
        Ok(workflow)
    }

    #[must_use]
    pub fn get_workflow(&self, id: WorkflowId) -> Option<Workflow> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Workflows still running, oldest first.
    #[must_use]
    pub fn active_workflows(&self) -> Vec<Workflow> {
        let mut active: Vec<Workflow> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.status == WorkflowStatus::Running)
            .cloned()
            .collect();
        active.sort_by_key(|w| w.started_at);
        active
    }

    /// Every workflow this engine has run, oldest first.
    #[must_use]
    pub fn workflows(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|w| w.started_at);
        all
    }

    /// Drop terminal workflows that ended at least `older_than` ago.
    ///
    /// Returns how many were removed. Running workflows are never pruned.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        let before = workflows.len();
        workflows.retain(|_, w| {
            !(w.status.is_terminal() && w.ended_at.is_some_and(|ended| ended <= cutoff))
        });
        let pruned = before - workflows.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned finished workflows");
        }
        pruned
    }

    /// Wait until a workflow reaches a terminal status.
    ///
    /// # Errors
    /// Returns error if the workflow is unknown.
    pub async fn wait_for(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        let mut rx = self.events.subscribe();
        loop {
            let workflow = self.get_workflow(id).ok_or(WorkflowError::NotFound(id))?;
            if workflow.status.is_terminal() {
                return Ok(workflow);
            }
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(workflow),
            }
        }
    }

    /// Cancel every running workflow and refuse new ones.
    ///
    /// Returns how many workflows were cancelled.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let handles: Vec<(WorkflowId, JoinHandle<()>)> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut cancelled = 0;
        for (id, handle) in handles {
            handle.abort();
            let transitioned = self.transition(id, |w| {
                w.status = WorkflowStatus::Cancelled;
                w.ended_at = Some(Utc::now());
            });
            if transitioned.is_some() {
                cancelled += 1;
                tracing::info!(workflow_id = %id, "workflow cancelled");
                self.events.publish(FlowEvent::WorkflowCancelled { workflow_id: id });
            }
        }
        cancelled
    }

    async fn run(self: Arc<Self>, id: WorkflowId) {
        let Some(workflow) = self.get_workflow(id) else {
            return;
        };
        let session_id = workflow.session_id;
        let steps = workflow.definition.steps;
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            let ctx = StepContext {
                workflow_id: id,
                workflow_name: workflow.name.clone(),
                session_id,
                step_name: step.name.clone(),
                step_index: index,
            };

            let started_at = Utc::now();
            let outcome = self.steps.execute(&ctx, step).await;
            let record = StepRecord {
                index,
                name: step.name.clone(),
                step_type: step.kind.type_name().to_string(),
                started_at,
                ended_at: Utc::now(),
                success: outcome.is_ok(),
                value: outcome.as_ref().ok().cloned().unwrap_or(Value::Null),
                error: outcome.as_ref().err().map(ToString::to_string),
            };

            self.update(id, |w| w.steps.push(record.clone()));
            if let Some(session_id) = session_id {
                self.persist_step(id, session_id, &record).await;
            }

            if let Err(e) = outcome {
                self.fail(id, &e).await;
                return;
            }

            let progress = progress(index + 1, total);
            self.update(id, |w| w.progress = progress);
            self.events.publish(FlowEvent::WorkflowProgress {
                workflow_id: id,
                step_index: index,
                progress,
            });
        }

        self.complete(id).await;
    }

    async fn persist_step(&self, id: WorkflowId, session_id: SessionId, record: &StepRecord) {
        let key = format!("workflow:{id}:step:{}", record.index);
        let namespace = session_namespace(session_id);
        if let Err(e) = self.memory.store(&key, record, &namespace).await {
            tracing::warn!(workflow_id = %id, key = %key, "failed to persist step result: {e}");
            return;
        }
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.record_memory_operation(session_id).await {
                tracing::warn!(session_id = %session_id, "failed to count memory operation: {e}");
            }
        }
    }

    async fn complete(&self, id: WorkflowId) {
        let Some(workflow) = self.transition(id, |w| {
            w.status = WorkflowStatus::Completed;
            w.ended_at = Some(Utc::now());
            w.progress = 100;
            w.result = Some(w.build_result());
        }) else {
            return;
        };
        self.release(id);

        let duration_ms = workflow.duration_ms();
        tracing::info!(workflow_id = %id, duration_ms, steps = workflow.steps.len(), "workflow completed");

        if let (Some(session_id), Some(sessions)) = (workflow.session_id, &self.sessions) {
            if let Err(e) = sessions.add_workflow(session_id, workflow.summary()).await {
                tracing::warn!(session_id = %session_id, "failed to append workflow summary: {e}");
            }
        }

        self.events.publish(FlowEvent::WorkflowCompleted {
            workflow_id: id,
            duration_ms,
        });
    }

    async fn fail(&self, id: WorkflowId, error: &StepError) {
        let failure = WorkflowFailure {
            message: error.to_string(),
            trace: error_chain(error),
            timestamp: Utc::now(),
        };
        let Some(workflow) = self.transition(id, |w| {
            w.status = WorkflowStatus::Failed;
            w.ended_at = Some(failure.timestamp);
            w.error = Some(failure.clone());
        }) else {
            return;
        };
        self.release(id);

        tracing::error!(workflow_id = %id, workflow = %workflow.name, "workflow failed: {error}");

        if let (Some(session_id), Some(sessions)) = (workflow.session_id, &self.sessions) {
            if let Err(e) = sessions.record_error(session_id).await {
                tracing::warn!(session_id = %session_id, "failed to count workflow error: {e}");
            }
        }

        self.events.publish(FlowEvent::WorkflowFailed {
            workflow_id: id,
            error: failure.message,
        });
    }

    fn update(&self, id: WorkflowId, apply: impl FnOnce(&mut Workflow)) {
        if let Some(w) = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            apply(w);
        }
    }

    /// Apply a terminal transition if the workflow is still running.
    fn transition(&self, id: WorkflowId, apply: impl FnOnce(&mut Workflow)) -> Option<Workflow> {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        let workflow = workflows.get_mut(&id)?;
        if workflow.status.is_terminal() {
            return None;
        }
        apply(workflow);
        Some(workflow.clone())
    }

    fn release(&self, id: WorkflowId) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
