use async_trait::async_trait;

use crate::{
    error::ProviderError,
    task::{ProviderKind, ProviderResponse, Task, TaskOptions},
};

/// One entry of the fallback chain.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which slot of the chain this provider fills.
    fn kind(&self) -> ProviderKind;

    /// Cheap availability check; must not block.
    fn is_available(&self) -> bool {
        true
    }

    /// Handle a task.
    ///
    /// # Errors
    /// Returns a `ProviderError` when the task cannot be handled; the router
    /// then falls back to the next provider.
    async fn execute(
        &self,
        task: &Task,
        options: &TaskOptions,
    ) -> Result<ProviderResponse, ProviderError>;
}
