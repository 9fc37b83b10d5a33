//! Session manager: lifecycle, admission control and checkpointing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    time::Duration,
};

use chrono::Utc;
use taskflow_core::{
    CheckpointId, EventBus, FlowEvent, PeriodicTask, SESSIONS_NAMESPACE, SessionId, SessionStatus,
};
use taskflow_memory::MemoryStore;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    error::SessionError,
    types::{Checkpoint, Session, SessionOptions, SessionUpdate, WorkflowSummary},
};

/// Description given to timer-driven checkpoints.
pub const AUTO_CHECKPOINT: &str = "Auto checkpoint";

/// Description of the checkpoint taken when a session ends.
pub const FINAL_CHECKPOINT: &str = "Session ended";

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Active sessions before expired ones are evicted on create.
    pub max_sessions: usize,
    /// Age after which an active session may be force-ended.
    pub session_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// Checkpoints retained per session, oldest evicted first.
    pub max_checkpoints: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_timeout: Duration::from_secs(60 * 60),
            checkpoint_interval: Duration::from_secs(5 * 60),
            max_checkpoints: 10,
        }
    }
}

type SessionHandle = Arc<Mutex<Session>>;

/// Owns every session of one engine.
///
/// Each session sits behind its own async mutex. The checkpoint timer and
/// API calls both take it, so mutations to one session never interleave.
pub struct SessionManager {
    config: SessionConfig,
    memory: Arc<MemoryStore>,
    events: Arc<EventBus>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    timers: StdMutex<HashMap<SessionId, PeriodicTask>>,
    this: Weak<Self>,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(config: SessionConfig, memory: Arc<MemoryStore>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            memory,
            events,
            sessions: RwLock::new(HashMap::new()),
            timers: StdMutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create and persist a new active session.
    ///
    /// At capacity, expired sessions are ended oldest first until one slot is
    /// free. Creation proceeds even if none could be ended.
    ///
    /// # Errors
    /// Returns error if the session cannot be persisted.
    pub async fn create_session(&self, options: SessionOptions) -> Result<Session, SessionError> {
        let active = self.active_count().await;
        if active >= self.config.max_sessions {
            let ended = self.end_expired(Some(active + 1 - self.config.max_sessions)).await;
            if ended.is_empty() {
                tracing::warn!(
                    active,
                    max = self.config.max_sessions,
                    "session capacity reached with no expired sessions, creating anyway"
                );
            }
        }

        let session = Session::new(options);
        self.persist(&session).await?;
        self.sessions
            .write()
            .await
            .insert(session.id, Arc::new(Mutex::new(session.clone())));
        self.start_timer(session.id);

        tracing::info!(session_id = %session.id, name = %session.name, "session created");
        self.events.publish(FlowEvent::SessionCreated {
            session_id: session.id,
            name: session.name.clone(),
        });

        Ok(session)
    }

    /// Look up a session, falling back to durable storage.
    ///
    /// # Errors
    /// Returns error if the durable read fails.
    pub async fn get_session(&self, id: SessionId) -> Result<Option<Session>, SessionError> {
        match self.find_handle(id).await? {
            Some(handle) => Ok(Some(handle.lock().await.clone())),
            None => Ok(None),
        }
    }

    /// End a session: stop its timer, take a final checkpoint and persist.
    ///
    /// Ending an already-ended session returns it unchanged.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn end_session(&self, id: SessionId) -> Result<Session, SessionError> {
        let handle = self.handle(id).await?;

        // Join the timer before locking; an in-flight tick holds the lock.
        self.stop_timer(id).await;

        let mut session = handle.lock().await;
        if !session.is_active() {
            return Ok(session.clone());
        }

        self.checkpoint_locked(&mut session, FINAL_CHECKPOINT).await?;

        let now = Utc::now();
        session.status = SessionStatus::Ended;
        session.end_time = Some(now);
        let duration_ms = now.signed_duration_since(session.start_time).num_milliseconds();
        session.duration_ms = Some(duration_ms);
        session.updated_at = now;
        self.persist(&session).await?;

        tracing::info!(session_id = %id, duration_ms, "session ended");
        self.events.publish(FlowEvent::SessionEnded {
            session_id: id,
            duration_ms,
        });

        Ok(session.clone())
    }

    /// Snapshot a session and its memory namespace.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn create_checkpoint(
        &self,
        id: SessionId,
        description: &str,
    ) -> Result<Checkpoint, SessionError> {
        let handle = self.handle(id).await?;
        let mut session = handle.lock().await;
        self.checkpoint_locked(&mut session, description).await
    }

    /// Replace session state and memory namespace with a checkpoint's.
    ///
    /// # Errors
    /// Returns error if the session or checkpoint is unknown, or if the
    /// namespace cannot be rewritten.
    pub async fn restore_checkpoint(
        &self,
        id: SessionId,
        checkpoint_id: CheckpointId,
    ) -> Result<Session, SessionError> {
        let handle = self.handle(id).await?;
        let mut session = handle.lock().await;

        let checkpoint = session
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
            .ok_or(SessionError::CheckpointNotFound {
                session_id: id,
                checkpoint_id,
            })?;

        session.apply(checkpoint.captured_state);
        self.memory
            .replace_namespace(&session.memory_namespace, &checkpoint.memory_snapshot)
            .await?;
        self.persist(&session).await?;

        tracing::info!(session_id = %id, checkpoint_id = %checkpoint_id, "checkpoint restored");
        self.events.publish(FlowEvent::CheckpointRestored {
            session_id: id,
            checkpoint_id,
        });

        Ok(session.clone())
    }

    /// Checkpoints of a session, oldest first.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn list_checkpoints(&self, id: SessionId) -> Result<Vec<Checkpoint>, SessionError> {
        let handle = self.handle(id).await?;
        let session = handle.lock().await;
        Ok(session.checkpoints.clone())
    }

    /// Append a finished workflow to a session.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn add_workflow(
        &self,
        id: SessionId,
        summary: WorkflowSummary,
    ) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            session.workflows.push(summary);
            session.stats.workflows_executed += 1;
        })
        .await
        .map(drop)
    }

    /// Rename, describe or merge metadata into a session.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn update_session(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<Session, SessionError> {
        self.mutate(id, |session| {
            if let Some(name) = update.name {
                session.name = name;
            }
            if let Some(description) = update.description {
                session.description = description;
            }
            session.metadata.extend(update.metadata);
        })
        .await
    }

    /// Count a memory operation performed on behalf of a session.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn record_memory_operation(&self, id: SessionId) -> Result<(), SessionError> {
        self.mutate(id, |session| session.stats.memory_operations += 1)
            .await
            .map(drop)
    }

    /// Count an error raised inside a session.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be persisted.
    pub async fn record_error(&self, id: SessionId) -> Result<(), SessionError> {
        self.mutate(id, |session| session.stats.errors += 1)
            .await
            .map(drop)
    }

    /// End every active session older than the configured timeout.
    ///
    /// Ended sessions are dropped from the in-memory map; they stay
    /// readable through [`SessionManager::get_session`].
    pub async fn cleanup_old_sessions(&self) -> Vec<SessionId> {
        let ended = self.end_expired(None).await;

        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        let mut finished = Vec::new();
        for (id, handle) in handles {
            if !handle.lock().await.is_active() {
                finished.push(id);
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &finished {
            sessions.remove(id);
        }

        if !ended.is_empty() {
            tracing::info!(ended = ended.len(), "cleaned up expired sessions");
        }
        ended
    }

    /// Every session held in memory.
    pub async fn sessions(&self) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by_key(|s| s.start_time);
        out
    }

    /// Active sessions, oldest first.
    pub async fn active_sessions(&self) -> Vec<Session> {
        self.sessions()
            .await
            .into_iter()
            .filter(Session::is_active)
            .collect()
    }

    /// Whether a session currently owns a checkpoint timer.
    #[must_use]
    pub fn has_checkpoint_timer(&self, id: SessionId) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .is_some_and(PeriodicTask::is_running)
    }

    /// Load persisted sessions, restarting timers for active ones.
    ///
    /// Unreadable records are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the durable store cannot be read.
    pub async fn load_sessions(&self) -> Result<usize, SessionError> {
        let mut loaded = 0;
        for key in self.memory.keys(SESSIONS_NAMESPACE) {
            let session = match self.memory.retrieve_as::<Session>(&key, SESSIONS_NAMESPACE).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, "skipping unreadable session: {e}");
                    continue;
                }
            };

            let id = session.id;
            let active = session.is_active();
            {
                let mut sessions = self.sessions.write().await;
                if sessions.contains_key(&id) {
                    continue;
                }
                sessions.insert(id, Arc::new(Mutex::new(session)));
            }
            if active {
                self.start_timer(id);
            }
            loaded += 1;
        }

        tracing::info!(loaded, "sessions loaded");
        Ok(loaded)
    }

    /// End every active session, taking a final checkpoint of each.
    ///
    /// Failures are logged; the remaining sessions are still ended.
    pub async fn shutdown(&self) -> usize {
        let mut ended = 0;
        for session in self.active_sessions().await {
            match self.end_session(session.id).await {
                Ok(_) => ended += 1,
                Err(e) => tracing::warn!(session_id = %session.id, "failed to end session: {e}"),
            }
        }

        // Timers of sessions that were already ended.
        let remaining: Vec<PeriodicTask> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in remaining {
            task.stop().await;
        }

        tracing::info!(ended, "session manager shut down");
        ended
    }

    async fn handle(&self, id: SessionId) -> Result<SessionHandle, SessionError> {
        self.find_handle(id).await?.ok_or(SessionError::NotFound(id))
    }

    /// Map lookup with a durable fallback. A session read back from storage
    /// is reinserted; its timer restarts only if it is still active.
    async fn find_handle(&self, id: SessionId) -> Result<Option<SessionHandle>, SessionError> {
        if let Some(handle) = self.sessions.read().await.get(&id).cloned() {
            return Ok(Some(handle));
        }

        let Some(session) = self
            .memory
            .retrieve_as::<Session>(&id.to_string(), SESSIONS_NAMESPACE)
            .await?
        else {
            return Ok(None);
        };

        let active = session.is_active();
        let (handle, inserted) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let handle = Arc::new(Mutex::new(session));
                    sessions.insert(id, Arc::clone(&handle));
                    (handle, true)
                }
            }
        };
        if inserted {
            tracing::debug!(session_id = %id, active, "session reloaded from storage");
            if active {
                self.start_timer(id);
            }
        }
        Ok(Some(handle))
    }

    async fn active_count(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut count = 0;
        for handle in handles {
            if handle.lock().await.is_active() {
                count += 1;
            }
        }
        count
    }

    /// End expired active sessions, oldest first, up to `limit`.
    async fn end_expired(&self, limit: Option<usize>) -> Vec<SessionId> {
        let now = Utc::now();
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            let session = handle.lock().await;
            if session.is_active() && session.is_expired(self.config.session_timeout, now) {
                expired.push((session.start_time, session.id));
            }
        }
        expired.sort();
        if let Some(limit) = limit {
            expired.truncate(limit);
        }

        let mut ended = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            match self.end_session(id).await {
                Ok(_) => {
                    tracing::info!(session_id = %id, "expired session ended");
                    ended.push(id);
                }
                Err(e) => tracing::warn!(session_id = %id, "failed to end expired session: {e}"),
            }
        }
        ended
    }

    async fn mutate<F>(&self, id: SessionId, apply: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session),
    {
        let handle = self.handle(id).await?;
        let mut session = handle.lock().await;
        apply(&mut session);
        session.updated_at = Utc::now();
        self.persist(&session).await?;
        Ok(session.clone())
    }

    async fn checkpoint_locked(
        &self,
        session: &mut Session,
        description: &str,
    ) -> Result<Checkpoint, SessionError> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            description: description.to_string(),
            captured_state: session.capture(),
            memory_snapshot: self.memory.export_namespace(&session.memory_namespace),
        };

        session.checkpoints.push(checkpoint.clone());
        let excess = session
            .checkpoints
            .len()
            .saturating_sub(self.config.max_checkpoints.max(1));
        session.checkpoints.drain(..excess);
        session.stats.checkpoints_created += 1;
        session.updated_at = checkpoint.timestamp;
        self.persist(session).await?;

        tracing::debug!(
            session_id = %session.id,
            checkpoint_id = %checkpoint.id,
            keys = checkpoint.memory_snapshot.len(),
            "checkpoint created"
        );
        self.events.publish(FlowEvent::CheckpointCreated {
            session_id: session.id,
            checkpoint_id: checkpoint.id,
            description: checkpoint.description.clone(),
        });

        Ok(checkpoint)
    }

    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        self.memory
            .store(&session.id.to_string(), session, SESSIONS_NAMESPACE)
            .await?;
        Ok(())
    }

    fn start_timer(&self, id: SessionId) {
        let manager = self.this.clone();
        let task = PeriodicTask::spawn(
            format!("checkpoint-{id}"),
            self.config.checkpoint_interval,
            move || {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    if let Err(e) = manager.create_checkpoint(id, AUTO_CHECKPOINT).await {
                        tracing::warn!(session_id = %id, "auto checkpoint failed: {e}");
                    }
                }
            },
        );
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);
    }

    async fn stop_timer(&self, id: SessionId) {
        let task = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use taskflow_core::{Classify, ErrorKind, WorkflowStatus};
    use taskflow_memory::{InMemoryBlobStorage, MemoryConfig};
    use tokio_test::assert_err;

    use super::*;

    async fn memory() -> Arc<MemoryStore> {
        MemoryStore::open(
            Arc::new(InMemoryBlobStorage::new()),
            MemoryConfig::write_through(),
            Arc::new(EventBus::new()),
        )
        .await
        .unwrap()
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            checkpoint_interval: Duration::from_secs(3600),
            ..SessionConfig::default()
        }
    }

    async fn manager_with(config: SessionConfig) -> (Arc<SessionManager>, Arc<MemoryStore>) {
        let memory = memory().await;
        let manager = SessionManager::new(config, memory.clone(), Arc::new(EventBus::new()));
        (manager, memory)
    }

    #[tokio::test]
    async fn test_create_get_and_persist() {
        let (manager, memory) = manager_with(quiet_config()).await;
        let session = manager
            .create_session(SessionOptions::named("audit"))
            .await
            .unwrap();

        let fetched = manager.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "audit");
        assert!(manager.has_checkpoint_timer(session.id));
        assert_eq!(memory.keys(SESSIONS_NAMESPACE), vec![session.id.to_string()]);
        assert!(manager.get_session(Uuid::new_v4()).await.unwrap().is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_ends_oldest_expired_session() {
        let config = SessionConfig {
            max_sessions: 2,
            session_timeout: Duration::ZERO,
            ..quiet_config()
        };
        let (manager, _) = manager_with(config).await;

        let first = manager.create_session(SessionOptions::named("one")).await.unwrap();
        let second = manager.create_session(SessionOptions::named("two")).await.unwrap();
        let third = manager.create_session(SessionOptions::named("three")).await.unwrap();

        let active: Vec<_> = manager.active_sessions().await.iter().map(|s| s.id).collect();
        assert_eq!(active, vec![second.id, third.id]);

        let first = manager.get_session(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, SessionStatus::Ended);
        assert!(!manager.has_checkpoint_timer(first.id));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_is_soft_without_expired_sessions() {
        let config = SessionConfig {
            max_sessions: 1,
            ..quiet_config()
        };
        let (manager, _) = manager_with(config).await;

        manager.create_session(SessionOptions::default()).await.unwrap();
        manager.create_session(SessionOptions::default()).await.unwrap();
        assert_eq!(manager.active_sessions().await.len(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_replaces_namespace() {
        let (manager, memory) = manager_with(quiet_config()).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();
        let ns = session.memory_namespace.clone();

        memory.store("a", &1, &ns).await.unwrap();
        let checkpoint = manager.create_checkpoint(session.id, "before b").await.unwrap();
        memory.store("b", &2, &ns).await.unwrap();
        memory.store("a", &5, &ns).await.unwrap();

        manager.restore_checkpoint(session.id, checkpoint.id).await.unwrap();

        assert_eq!(memory.retrieve("a", &ns).await.unwrap(), Some(json!(1)));
        assert_eq!(memory.retrieve("b", &ns).await.unwrap(), None);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_replaces_session_fields() {
        let (manager, _) = manager_with(quiet_config()).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();
        let checkpoint = manager.create_checkpoint(session.id, "clean").await.unwrap();

        manager.record_error(session.id).await.unwrap();
        let update = SessionUpdate {
            metadata: serde_json::Map::from_iter([("k".to_string(), json!("v"))]),
            ..SessionUpdate::default()
        };
        manager.update_session(session.id, update).await.unwrap();

        let restored = manager.restore_checkpoint(session.id, checkpoint.id).await.unwrap();
        assert_eq!(restored.stats.errors, 0);
        assert!(restored.metadata.is_empty());

        let err = assert_err!(manager.restore_checkpoint(session.id, Uuid::new_v4()).await);
        assert_eq!(err.kind(), ErrorKind::NotFound);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoints_capped_oldest_evicted() {
        let (manager, _) = manager_with(quiet_config()).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..11 {
            ids.push(manager.create_checkpoint(session.id, &format!("cp {i}")).await.unwrap().id);
        }

        let kept: Vec<_> = manager
            .list_checkpoints(session.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept, ids[1..].to_vec());

        let session = manager.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.stats.checkpoints_created, 11);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_session_stops_checkpoint_timer() {
        let config = SessionConfig {
            checkpoint_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let (manager, _) = manager_with(config).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        let ended = manager.end_session(session.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.duration_ms.is_some());
        assert_eq!(
            ended.latest_checkpoint().map(|c| c.description.as_str()),
            Some(FINAL_CHECKPOINT)
        );
        assert!(ended
            .checkpoints
            .iter()
            .any(|c| c.description == AUTO_CHECKPOINT));
        assert!(!manager.has_checkpoint_timer(session.id));

        let count = ended.checkpoints.len();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let later = manager.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(later.checkpoints.len(), count);
        assert_eq!(later.stats.checkpoints_created, ended.stats.checkpoints_created);
    }

    #[tokio::test]
    async fn test_end_twice_returns_unchanged() {
        let (manager, _) = manager_with(quiet_config()).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();

        let first = manager.end_session(session.id).await.unwrap();
        let second = manager.end_session(session.id).await.unwrap();
        assert_eq!(first, second);

        let err = assert_err!(manager.end_session(Uuid::new_v4()).await);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_add_workflow_and_counters() {
        let (manager, _) = manager_with(quiet_config()).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();

        let summary = WorkflowSummary {
            id: Uuid::new_v4(),
            name: "run_tests".into(),
            status: WorkflowStatus::Completed,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            result: None,
        };
        manager.add_workflow(session.id, summary.clone()).await.unwrap();
        manager.record_memory_operation(session.id).await.unwrap();
        manager.record_memory_operation(session.id).await.unwrap();

        let session = manager.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.workflows, vec![summary]);
        assert_eq!(session.stats.workflows_executed, 1);
        assert_eq!(session.stats.memory_operations, 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_old_sessions() {
        let config = SessionConfig {
            session_timeout: Duration::ZERO,
            ..quiet_config()
        };
        let (manager, _) = manager_with(config).await;
        let a = manager.create_session(SessionOptions::default()).await.unwrap();
        let b = manager.create_session(SessionOptions::default()).await.unwrap();

        let mut ended = manager.cleanup_old_sessions().await;
        ended.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ended, expected);

        assert!(manager.sessions().await.is_empty());
        let a = manager.get_session(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_cleaned_up_session_is_still_addressable() {
        let config = SessionConfig {
            session_timeout: Duration::ZERO,
            ..quiet_config()
        };
        let (manager, _) = manager_with(config).await;
        let session = manager.create_session(SessionOptions::default()).await.unwrap();
        manager.cleanup_old_sessions().await;
        assert!(manager.sessions().await.is_empty());

        let loaded = manager.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);

        let checkpoints = manager.list_checkpoints(session.id).await.unwrap();
        assert!(checkpoints.iter().any(|c| c.description == FINAL_CHECKPOINT));
        assert!(!manager.has_checkpoint_timer(session.id));

        let unknown = manager.list_checkpoints(Uuid::new_v4()).await;
        assert!(matches!(unknown, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_sessions_restarts_timers() {
        let memory = memory().await;
        let events = Arc::new(EventBus::new());
        let (active_id, ended_id) = {
            let manager = SessionManager::new(quiet_config(), memory.clone(), events.clone());
            let active = manager.create_session(SessionOptions::default()).await.unwrap();
            let ended = manager.create_session(SessionOptions::default()).await.unwrap();
            manager.end_session(ended.id).await.unwrap();
            (active.id, ended.id)
        };

        let manager = SessionManager::new(quiet_config(), memory, events);
        assert_eq!(manager.load_sessions().await.unwrap(), 2);
        assert!(manager.has_checkpoint_timer(active_id));
        assert!(!manager.has_checkpoint_timer(ended_id));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_published() {
        let memory = memory().await;
        let events = Arc::new(EventBus::new());
        let manager = SessionManager::new(quiet_config(), memory, events.clone());

        let session = manager.create_session(SessionOptions::default()).await.unwrap();
        manager.end_session(session.id).await.unwrap();

        let kinds: Vec<_> = events
            .history()
            .into_iter()
            .filter(|e| !matches!(e, FlowEvent::MemoryStored { .. }))
            .collect();
        assert!(matches!(kinds[0], FlowEvent::SessionCreated { .. }));
        assert!(matches!(kinds[1], FlowEvent::CheckpointCreated { .. }));
        assert!(matches!(kinds[2], FlowEvent::SessionEnded { .. }));
    }
}
