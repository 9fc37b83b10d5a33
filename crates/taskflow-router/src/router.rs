//! Provider selection and the fallback chain.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{ProviderError, Result, RouterError},
    provider::Provider,
    task::{ProviderKind, ProviderResponse, Task, TaskKind, TaskOptions, Urgency},
};

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Used when no selection rule matches.
    pub default_provider: ProviderKind,
    /// Walked in order after the selected provider fails.
    pub fallback_chain: Vec<ProviderKind>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_provider: ProviderKind::Primary,
            fallback_chain: vec![
                ProviderKind::Primary,
                ProviderKind::ExternalTool,
                ProviderKind::Static,
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub hybrid_calls: u64,
    pub fallbacks: u64,
    pub errors: u64,
    pub provider_calls: BTreeMap<ProviderKind, u64>,
}

/// Snapshot returned by [`ProviderRouter::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatus {
    pub external_tool_available: bool,
    pub default_provider: ProviderKind,
    pub fallback_chain: Vec<ProviderKind>,
    pub stats: RouterStats,
}

/// Routes tasks to a provider and falls back along the chain on failure.
pub struct ProviderRouter {
    fallback_chain: Vec<ProviderKind>,
    default_provider: RwLock<ProviderKind>,
    providers: RwLock<HashMap<ProviderKind, Arc<dyn Provider>>>,
    stats: Mutex<RouterStats>,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("fallback_chain", &self.fallback_chain)
            .field("default_provider", &self.default_provider())
            .field("providers", &self.registered())
            .finish_non_exhaustive()
    }
}

impl ProviderRouter {
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            fallback_chain: config.fallback_chain,
            default_provider: RwLock::new(config.default_provider),
            providers: RwLock::new(HashMap::new()),
            stats: Mutex::new(RouterStats::default()),
        }
    }

    /// Register a provider under its own kind, replacing any previous one.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let kind = provider.kind();
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, provider);
        debug!(provider = %kind, "Registered provider");
    }

    #[must_use]
    pub fn with_provider(self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Registered provider kinds, sorted.
    #[must_use]
    pub fn registered(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }

    #[must_use]
    pub fn default_provider(&self) -> ProviderKind {
        *self
            .default_provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_default_provider(&self, kind: ProviderKind) {
        *self
            .default_provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = kind;
        info!(provider = %kind, "Default provider changed");
    }

    fn provider(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    fn external_available(&self) -> bool {
        self.provider(ProviderKind::ExternalTool)
            .is_some_and(|p| p.is_available())
    }

    /// Pick the provider that should try a task first.
    #[must_use]
    pub fn select_provider(&self, task: &Task, options: &TaskOptions) -> ProviderKind {
        match task.kind {
            TaskKind::Workflow | TaskKind::Automation => return ProviderKind::Primary,
            TaskKind::CodeGeneration if self.external_available() => {
                return ProviderKind::ExternalTool;
            }
            _ => {}
        }
        if task.urgency == Urgency::High || options.requires_real_time {
            return ProviderKind::Primary;
        }
        self.default_provider()
    }

    /// Run a task on the selected provider, falling back along the chain.
    ///
    /// # Errors
    /// Returns `RouterError::ProviderUnavailable` carrying the first failure
    /// when every provider fails.
    pub async fn execute_hybrid_task(
        &self,
        task: &Task,
        options: &TaskOptions,
    ) -> Result<ProviderResponse> {
        self.with_stats(|s| s.hybrid_calls += 1);

        let selected = self.select_provider(task, options);
        debug!(provider = %selected, kind = ?task.kind, "Routing task");

        let err = match self.invoke(selected, task, options).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        self.with_stats(|s| {
            s.errors += 1;
            s.fallbacks += 1;
        });
        warn!(provider = %selected, %err, "Provider failed, falling back");

        for &kind in self.fallback_chain.iter().filter(|&&k| k != selected) {
            match self.invoke(kind, task, options).await {
                Ok(response) => {
                    info!(provider = %kind, "Fallback provider succeeded");
                    return Ok(response);
                }
                Err(fallback_err) => {
                    self.with_stats(|s| s.errors += 1);
                    debug!(provider = %kind, err = %fallback_err, "Fallback provider failed");
                }
            }
        }

        Err(RouterError::ProviderUnavailable { source: err })
    }

    async fn invoke(
        &self,
        kind: ProviderKind,
        task: &Task,
        options: &TaskOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let provider = self
            .provider(kind)
            .ok_or(ProviderError::NotRegistered(kind))?;
        self.with_stats(|s| *s.provider_calls.entry(kind).or_default() += 1);
        provider.execute(task, options).await
    }

    fn with_stats(&self, f: impl FnOnce(&mut RouterStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            external_tool_available: self.external_available(),
            default_provider: self.default_provider(),
            fallback_chain: self.fallback_chain.clone(),
            stats: self.stats(),
        }
    }
}
