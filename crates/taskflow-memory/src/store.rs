//! Two-tier namespaced memory store.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use taskflow_core::{BlobStorage, EventBus, FlowEvent, PeriodicTask};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    entry::MemoryEntry,
    error::MemoryError,
    query::{SearchHit, SearchOptions, SearchQuery, sort_hits},
};

/// Memory store configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Flush periodically instead of writing through on every store.
    pub autosave: bool,
    /// Period of the background flush.
    pub autosave_interval: Duration,
    /// Soft limit on the total serialized size of the working set.
    pub max_memory_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            autosave: true,
            autosave_interval: Duration::from_secs(30),
            max_memory_size: 100 * 1024 * 1024,
        }
    }
}

impl MemoryConfig {
    /// Write every store through to durable storage immediately.
    #[must_use]
    pub fn write_through() -> Self {
        Self {
            autosave: false,
            ..Self::default()
        }
    }

    /// Enable periodic flushing with the given period.
    #[must_use]
    pub const fn with_autosave(mut self, interval: Duration) -> Self {
        self.autosave = true;
        self.autosave_interval = interval;
        self
    }

    /// Set the soft size limit.
    #[must_use]
    pub const fn with_max_memory_size(mut self, bytes: usize) -> Self {
        self.max_memory_size = bytes;
        self
    }
}

/// Snapshot of store counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub retrievals: u64,
    pub searches: u64,
    /// Entries in the working set.
    pub entries: usize,
    pub namespaces: usize,
    /// Total serialized size of the working set in bytes.
    pub total_size: usize,
    /// Hits as a percentage of all operations.
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    operations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    retrievals: AtomicU64,
    searches: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct Inner {
    /// namespace -> key -> entry
    entries: HashMap<String, BTreeMap<String, MemoryEntry>>,
    /// Entries written since the last flush.
    dirty: HashSet<(String, String)>,
    total_size: usize,
}

impl Inner {
    fn insert(&mut self, entry: MemoryEntry) -> Option<MemoryEntry> {
        self.total_size += entry.size;
        let previous = self
            .entries
            .entry(entry.namespace.clone())
            .or_default()
            .insert(entry.key.clone(), entry);
        if let Some(prev) = &previous {
            self.total_size = self.total_size.saturating_sub(prev.size);
        }
        previous
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Option<MemoryEntry> {
        self.dirty.remove(&(namespace.to_string(), key.to_string()));
        let ns = self.entries.get_mut(namespace)?;
        let removed = ns.remove(key);
        if ns.is_empty() {
            self.entries.remove(namespace);
        }
        if let Some(entry) = &removed {
            self.total_size = self.total_size.saturating_sub(entry.size);
        }
        removed
    }

    fn remove_namespace(&mut self, namespace: &str) {
        self.dirty.retain(|(ns, _)| ns != namespace);
        if let Some(entries) = self.entries.remove(namespace) {
            let freed: usize = entries.values().map(|e| e.size).sum();
            self.total_size = self.total_size.saturating_sub(freed);
        }
    }
}

/// Namespaced key-value store with an in-memory working set backed by
/// durable [`BlobStorage`].
///
/// Values are serialized into an owned [`Value`] on write, so later mutation
/// of the caller's object never reaches stored history.
pub struct MemoryStore {
    config: MemoryConfig,
    storage: Arc<dyn BlobStorage>,
    inner: RwLock<Inner>,
    /// Held across every durable mutation so a flush can never write back a
    /// record that a concurrent delete or clear already removed.
    durable: AsyncMutex<()>,
    counters: Counters,
    events: Arc<EventBus>,
    autosave: Mutex<Option<PeriodicTask>>,
}

impl MemoryStore {
    /// Open a store, loading every durable record into memory.
    ///
    /// Starts the autosave sweep when enabled.
    ///
    /// # Errors
    /// Returns error if the durable namespaces cannot be listed.
    pub async fn open(
        storage: Arc<dyn BlobStorage>,
        config: MemoryConfig,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, MemoryError> {
        let store = Arc::new(Self {
            config,
            storage,
            inner: RwLock::new(Inner::default()),
            durable: AsyncMutex::new(()),
            counters: Counters::default(),
            events,
            autosave: Mutex::new(None),
        });

        let loaded = store.load_all().await?;
        tracing::info!(entries = loaded, "memory store opened");

        if store.config.autosave {
            store.start_autosave();
        }

        Ok(store)
    }

    /// Store a value, returning the new entry id.
    ///
    /// # Errors
    /// Returns error if the value cannot be serialized or, with autosave
    /// disabled, if the durable write fails.
    pub async fn store<T>(&self, key: &str, value: &T, namespace: &str) -> Result<Uuid, MemoryError>
    where
        T: Serialize + ?Sized,
    {
        bump(&self.counters.operations);
        bump(&self.counters.stores);

        let value = serde_json::to_value(value)?;
        let _durable = if self.config.autosave {
            None
        } else {
            Some(self.durable.lock().await)
        };
        let (entry, total_size) = {
            let mut inner = self.write_inner();
            let previous = inner.entries.get(namespace).and_then(|ns| ns.get(key));
            let entry = MemoryEntry::new(namespace, key, value, previous);
            inner.insert(entry.clone());
            inner.dirty.insert((namespace.to_string(), key.to_string()));
            (entry, inner.total_size)
        };

        if !self.config.autosave {
            self.persist(&entry).await?;
            self.write_inner()
                .dirty
                .remove(&(namespace.to_string(), key.to_string()));
        }

        if total_size > self.config.max_memory_size {
            tracing::warn!(
                total_size,
                limit = self.config.max_memory_size,
                "memory working set exceeds configured size"
            );
        }

        tracing::debug!(namespace, key, size = entry.size, version = entry.version, "stored memory");
        self.events.publish(FlowEvent::MemoryStored {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });

        Ok(entry.id)
    }

    /// Retrieve a value, falling through to durable storage on a miss.
    ///
    /// # Errors
    /// Returns error if the durable read or decode fails.
    pub async fn retrieve(&self, key: &str, namespace: &str) -> Result<Option<Value>, MemoryError> {
        bump(&self.counters.operations);
        bump(&self.counters.retrievals);

        let cached = {
            let mut inner = self.write_inner();
            inner
                .entries
                .get_mut(namespace)
                .and_then(|ns| ns.get_mut(key))
                .map(|entry| {
                    entry.touch();
                    entry.value.clone()
                })
        };
        if let Some(value) = cached {
            bump(&self.counters.hits);
            tracing::debug!(namespace, key, "retrieved from memory");
            self.publish_retrieved(namespace, key);
            return Ok(Some(value));
        }

        let _durable = self.durable.lock().await;
        let Some(bytes) = self.storage.get(namespace, key).await? else {
            bump(&self.counters.misses);
            tracing::debug!(namespace, key, "memory not found");
            return Ok(None);
        };

        let mut entry: MemoryEntry = serde_json::from_slice(&bytes)?;
        entry.touch();
        let value = entry.value.clone();
        {
            let mut inner = self.write_inner();
            let present = inner
                .entries
                .get(namespace)
                .is_some_and(|ns| ns.contains_key(key));
            if !present {
                inner.insert(entry);
            }
        }

        bump(&self.counters.hits);
        tracing::debug!(namespace, key, "retrieved from durable storage");
        self.publish_retrieved(namespace, key);
        Ok(Some(value))
    }

    /// Retrieve and decode a value into `T`.
    ///
    /// # Errors
    /// Returns error if retrieval fails or the value does not decode as `T`.
    pub async fn retrieve_as<T: DeserializeOwned>(
        &self,
        key: &str,
        namespace: &str,
    ) -> Result<Option<T>, MemoryError> {
        self.retrieve(key, namespace)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Search the working set.
    #[must_use]
    pub fn search(&self, query: &SearchQuery, options: &SearchOptions) -> Vec<SearchHit> {
        bump(&self.counters.operations);
        bump(&self.counters.searches);

        let mut hits: Vec<SearchHit> = {
            let inner = self.read_inner();
            inner
                .entries
                .iter()
                .filter(|(ns, _)| options.namespace.as_ref().is_none_or(|want| want == *ns))
                .flat_map(|(_, entries)| entries.values())
                .filter(|entry| query.matches(entry))
                .map(|entry| SearchHit::from_entry(entry, options.include_value))
                .collect()
        };

        sort_hits(&mut hits, options.sort_by, options.sort_order);
        if options.limit > 0 {
            hits.truncate(options.limit);
        }

        tracing::debug!(?query, results = hits.len(), namespace = ?options.namespace, "search completed");
        hits
    }

    /// Delete a key from memory and durable storage.
    ///
    /// Returns whether the key existed in either tier.
    ///
    /// # Errors
    /// Returns error if the durable delete fails.
    pub async fn delete(&self, key: &str, namespace: &str) -> Result<bool, MemoryError> {
        let _durable = self.durable.lock().await;
        let in_memory = self.write_inner().remove(namespace, key).is_some();
        let in_storage = self.storage.delete(namespace, key).await?;

        let deleted = in_memory || in_storage;
        if deleted {
            tracing::debug!(namespace, key, "deleted memory");
            self.events.publish(FlowEvent::MemoryDeleted {
                namespace: namespace.to_string(),
                key: key.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Clear one namespace, or everything when `namespace` is `None`.
    ///
    /// # Errors
    /// Returns error if durable records cannot be listed or deleted.
    pub async fn clear(&self, namespace: Option<&str>) -> Result<(), MemoryError> {
        let _durable = self.durable.lock().await;
        match namespace {
            Some(ns) => {
                self.write_inner().remove_namespace(ns);
                for key in self.storage.list(ns).await? {
                    self.storage.delete(ns, &key).await?;
                }
            }
            None => {
                *self.write_inner() = Inner::default();
                for ns in self.storage.namespaces().await? {
                    for key in self.storage.list(&ns).await? {
                        self.storage.delete(&ns, &key).await?;
                    }
                }
            }
        }

        tracing::debug!(namespace = ?namespace, "cleared memory");
        self.events.publish(FlowEvent::MemoryCleared {
            namespace: namespace.map(str::to_string),
        });
        Ok(())
    }

    /// Namespaces present in the working set, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_inner().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys of a namespace, sorted.
    #[must_use]
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        self.read_inner()
            .entries
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of every value in a namespace.
    #[must_use]
    pub fn export_namespace(&self, namespace: &str) -> BTreeMap<String, Value> {
        self.read_inner()
            .entries
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clear a namespace and repopulate it from `snapshot`.
    ///
    /// # Errors
    /// Returns error if clearing or storing fails.
    pub async fn replace_namespace(
        &self,
        namespace: &str,
        snapshot: &BTreeMap<String, Value>,
    ) -> Result<(), MemoryError> {
        self.clear(Some(namespace)).await?;
        for (key, value) in snapshot {
            self.store(key, value, namespace).await?;
        }
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let operations = load(&self.counters.operations);
        let hits = load(&self.counters.hits);
        let inner = self.read_inner();

        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if operations == 0 {
            0.0
        } else {
            hits as f64 / operations as f64 * 100.0
        };

        MemoryStats {
            operations,
            hits,
            misses: load(&self.counters.misses),
            stores: load(&self.counters.stores),
            retrievals: load(&self.counters.retrievals),
            searches: load(&self.counters.searches),
            entries: inner.entries.values().map(BTreeMap::len).sum(),
            namespaces: inner.entries.len(),
            total_size: inner.total_size,
            hit_rate,
        }
    }

    /// Persist entries written since the last flush.
    ///
    /// Entries that fail to persist stay dirty for the next attempt.
    ///
    /// # Errors
    /// Returns the first persistence error encountered.
    pub async fn flush(&self) -> Result<usize, MemoryError> {
        let _durable = self.durable.lock().await;
        let pending: Vec<MemoryEntry> = {
            let mut inner = self.write_inner();
            let dirty: Vec<_> = inner.dirty.drain().collect();
            dirty
                .iter()
                .filter_map(|(ns, key)| inner.entries.get(ns).and_then(|n| n.get(key)).cloned())
                .collect()
        };

        let mut written = 0;
        let mut first_error = None;
        for entry in pending {
            match self.persist(&entry).await {
                Ok(()) => written += 1,
                Err(e) => {
                    self.write_inner()
                        .dirty
                        .insert((entry.namespace.clone(), entry.key.clone()));
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Persist every entry in the working set.
    ///
    /// # Errors
    /// Returns the first persistence error encountered.
    pub async fn persist_all(&self) -> Result<usize, MemoryError> {
        let _durable = self.durable.lock().await;
        let all: Vec<MemoryEntry> = {
            let mut inner = self.write_inner();
            inner.dirty.clear();
            inner
                .entries
                .values()
                .flat_map(BTreeMap::values)
                .cloned()
                .collect()
        };

        let count = all.len();
        for entry in &all {
            self.persist(entry).await?;
        }
        Ok(count)
    }

    /// Stop the autosave sweep and persist every entry.
    ///
    /// # Errors
    /// Returns error if the final flush fails.
    pub async fn shutdown(&self) -> Result<(), MemoryError> {
        let task = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }

        let written = self.persist_all().await?;
        tracing::info!(entries = written, "memory store shut down");
        Ok(())
    }

    async fn persist(&self, entry: &MemoryEntry) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        self.storage.put(&entry.namespace, &entry.key, bytes).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<usize, MemoryError> {
        let mut loaded = 0;
        for ns in self.storage.namespaces().await? {
            for key in self.storage.list(&ns).await? {
                let entry = match self.storage.get(&ns, &key).await {
                    Ok(Some(bytes)) => serde_json::from_slice::<MemoryEntry>(&bytes),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(namespace = %ns, key = %key, "failed to load record: {e}");
                        continue;
                    }
                };
                match entry {
                    Ok(entry) => {
                        self.write_inner().insert(entry);
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(namespace = %ns, key = %key, "skipping unreadable record: {e}");
                    }
                }
            }
        }
        Ok(loaded)
    }

    fn start_autosave(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = PeriodicTask::spawn("memory-autosave", self.config.autosave_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                match store.flush().await {
                    Ok(0) => {}
                    Ok(written) => tracing::debug!(written, "autosave completed"),
                    Err(e) => tracing::warn!("autosave failed: {e}"),
                }
            }
        });
        *self.autosave.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn publish_retrieved(&self, namespace: &str, key: &str) {
        self.events.publish(FlowEvent::MemoryRetrieved {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
