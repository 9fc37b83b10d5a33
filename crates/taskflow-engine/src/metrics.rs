//! Engine-level counters fed by the event bus.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskflow_core::{EventBus, FlowEvent, SESSIONS_NAMESPACE, SYSTEM_NAMESPACE, WorkflowId};
use taskflow_memory::MemoryStore;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub workflows_executed: u64,
    pub memory_operations: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    sessions_created: AtomicU64,
    workflows_executed: AtomicU64,
    memory_operations: AtomicU64,
    errors: AtomicU64,
}

impl EngineMetrics {
    /// Update counters for one event.
    pub fn record(&self, event: &FlowEvent) {
        let counter = match event {
            FlowEvent::SessionCreated { .. } => &self.sessions_created,
            FlowEvent::WorkflowCompleted { .. } => &self.workflows_executed,
            FlowEvent::WorkflowFailed { .. } => &self.errors,
            FlowEvent::MemoryStored { namespace, .. }
            | FlowEvent::MemoryRetrieved { namespace, .. }
                if !is_reserved(namespace) =>
            {
                &self.memory_operations
            }
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            workflows_executed: self.workflows_executed.load(Ordering::Relaxed),
            memory_operations: self.memory_operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Overwrite every counter, e.g. from a saved engine state.
    pub fn restore(&self, snapshot: MetricsSnapshot) {
        self.sessions_created
            .store(snapshot.sessions_created, Ordering::Relaxed);
        self.workflows_executed
            .store(snapshot.workflows_executed, Ordering::Relaxed);
        self.memory_operations
            .store(snapshot.memory_operations, Ordering::Relaxed);
        self.errors.store(snapshot.errors, Ordering::Relaxed);
    }
}

/// Bookkeeping writes (sessions, engine state, error log) are not user
/// memory operations.
fn is_reserved(namespace: &str) -> bool {
    namespace == SESSIONS_NAMESPACE || namespace == SYSTEM_NAMESPACE
}

/// Consume events until `token` is cancelled.
///
/// Workflow failures are also appended to the `system` namespace as
/// `errors/<millis>-<workflow id>`; write failures are logged.
pub(crate) fn spawn_listener(
    events: &EventBus,
    metrics: Arc<EngineMetrics>,
    memory: Arc<MemoryStore>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "metrics listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            metrics.record(&event);
            if let FlowEvent::WorkflowFailed { workflow_id, error } = &event {
                record_failure(&memory, *workflow_id, error).await;
            }
        }
        tracing::debug!("metrics listener stopped");
    })
}

async fn record_failure(memory: &MemoryStore, workflow_id: WorkflowId, error: &str) {
    let now = Utc::now();
    let key = format!("errors/{}-{workflow_id}", now.timestamp_millis());
    let record = json!({
        "timestamp": now,
        "level": "error",
        "workflow_id": workflow_id,
        "message": error,
    });
    if let Err(e) = memory.store(&key, &record, SYSTEM_NAMESPACE).await {
        tracing::warn!(workflow_id = %workflow_id, "failed to record workflow failure: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskflow_memory::{InMemoryBlobStorage, MemoryConfig};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_record_counts_by_event() {
        let metrics = EngineMetrics::default();
        metrics.record(&FlowEvent::SessionCreated {
            session_id: Uuid::new_v4(),
            name: "s".into(),
        });
        metrics.record(&FlowEvent::WorkflowCompleted {
            workflow_id: Uuid::new_v4(),
            duration_ms: 3,
        });
        metrics.record(&FlowEvent::WorkflowFailed {
            workflow_id: Uuid::new_v4(),
            error: "boom".into(),
        });
        metrics.record(&FlowEvent::MemoryStored {
            namespace: "default".into(),
            key: "k".into(),
        });
        metrics.record(&FlowEvent::MemoryRetrieved {
            namespace: "default".into(),
            key: "k".into(),
        });
        metrics.record(&FlowEvent::MemoryStored {
            namespace: SESSIONS_NAMESPACE.into(),
            key: "k".into(),
        });
        metrics.record(&FlowEvent::MemoryStored {
            namespace: SYSTEM_NAMESPACE.into(),
            key: "k".into(),
        });

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                sessions_created: 1,
                workflows_executed: 1,
                memory_operations: 2,
                errors: 1,
            }
        );
    }

    #[test]
    fn test_restore() {
        let metrics = EngineMetrics::default();
        let saved = MetricsSnapshot {
            sessions_created: 5,
            workflows_executed: 10,
            memory_operations: 0,
            errors: 2,
        };
        metrics.restore(saved);
        assert_eq!(metrics.snapshot(), saved);
    }

    #[tokio::test]
    async fn test_listener_records_failures_in_system_namespace() {
        let events = Arc::new(EventBus::new());
        let memory = MemoryStore::open(
            Arc::new(InMemoryBlobStorage::new()),
            MemoryConfig::write_through(),
            Arc::clone(&events),
        )
        .await
        .unwrap();
        let metrics = Arc::new(EngineMetrics::default());
        let token = CancellationToken::new();
        let handle = spawn_listener(&events, Arc::clone(&metrics), Arc::clone(&memory), token.clone());

        let workflow_id = Uuid::new_v4();
        events.publish(FlowEvent::WorkflowFailed {
            workflow_id,
            error: "step exploded".into(),
        });

        let mut keys = Vec::new();
        for _ in 0..100 {
            keys = memory.keys(SYSTEM_NAMESPACE);
            if !keys.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("errors/"));
        assert!(keys[0].ends_with(&workflow_id.to_string()));

        let record = memory.retrieve(&keys[0], SYSTEM_NAMESPACE).await.unwrap().unwrap();
        assert_eq!(record["message"], "step exploded");
        assert_eq!(metrics.snapshot().errors, 1);
        // the error-log write itself is not a user memory operation
        assert_eq!(metrics.snapshot().memory_operations, 0);

        token.cancel();
        handle.await.unwrap();
    }
}
