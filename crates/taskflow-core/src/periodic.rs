//! Cancellable periodic background tasks.

use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A background task that runs `tick` every `period` until stopped.
///
/// The first tick fires one full period after spawning. Dropping the handle
/// cancels the loop without waiting for it; [`PeriodicTask::stop`] cancels and
/// waits, so no tick is in flight once it returns.
pub struct PeriodicTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a periodic task on the current runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let child = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = child.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = %task_name, "periodic task stopped");
        });

        tracing::debug!(task = %name, ?period, "periodic task started");
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Task name, for logging.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for an in-flight tick to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::warn!(task = %self.name, "periodic task panicked");
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
