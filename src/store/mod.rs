//! Keyed, lockable entity storage backed by a persistent store.

mod durable;
mod entry;
mod load;

pub use durable::LogStore;
pub use entry::{CacheEntry, LockedCacheEntry};
pub use load::{LoadInfo, LoadMetrics, PersistenceState};

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::utils::FailoverError;

use async_trait::async_trait;

use parking_lot::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// One persisted change: `Some(value)` inserts or replaces, `None` deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreWrite<K, T> {
    pub key: K,
    pub value: Option<T>,
}

/// Durable backend of an `EntityStore`. A `commit` is atomic: either every
/// write of the batch is durable or none is.
#[async_trait]
pub trait PersistentStore<K, T>: Send + Sync {
    /// Reads back every live record.
    async fn load_all(&self) -> Result<Vec<(K, T)>, FailoverError>;

    /// Persists a batch of writes.
    async fn commit(&self, writes: Vec<StoreWrite<K, T>>) -> Result<(), FailoverError>;
}

/// In-memory backend. Supports injecting commit failures.
#[derive(Debug)]
pub struct MemoryStore<K, T> {
    records: Mutex<HashMap<K, T>>,
    fail_next: AtomicUsize,
    commits: AtomicUsize,
}

impl<K, T> Default for MemoryStore<K, T> {
    fn default() -> Self {
        MemoryStore {
            records: Mutex::new(HashMap::new()),
            fail_next: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }
}

impl<K, T> MemoryStore<K, T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<K, T> PersistentStore<K, T> for MemoryStore<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn load_all(&self) -> Result<Vec<(K, T)>, FailoverError> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(&self, writes: Vec<StoreWrite<K, T>>) -> Result<(), FailoverError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FailoverError::msg("injected commit failure"));
        }

        let mut records = self.records.lock();
        for write in writes {
            match write.value {
                Some(v) => {
                    records.insert(write.key, v);
                }
                None => {
                    records.remove(&write.key);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Cache of lockable entities over a persistent backend.
pub struct EntityStore<K, T> {
    /// Name used as logging prefix.
    name: String,

    entries: RwLock<HashMap<K, Arc<CacheEntry<K, T>>>>,

    backend: Arc<dyn PersistentStore<K, T>>,
}

impl<K, T> fmt::Debug for EntityStore<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EntityStore({}, {} entries)", self.name, self.entries.read().len())
    }
}

impl<K, T> EntityStore<K, T>
where
    K: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty store over the given backend.
    pub fn new(name: impl Into<String>, backend: Arc<dyn PersistentStore<K, T>>) -> Self {
        EntityStore {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            backend,
        }
    }

    /// Creates a store and loads every persisted record from the backend.
    pub async fn open(
        name: impl Into<String>,
        backend: Arc<dyn PersistentStore<K, T>>,
    ) -> Result<Self, FailoverError> {
        let store = Self::new(name, backend);
        let records = store.backend.load_all().await?;
        {
            let mut entries = store.entries.write();
            for (key, value) in records {
                entries.insert(key.clone(), CacheEntry::new(key, Some(value)));
            }
        }
        pf_debug!(store.name; "loaded {} records", store.len());
        Ok(store)
    }

    /// Last committed value of `key`, without locking.
    pub fn try_get(&self, key: &K) -> Option<Arc<T>> {
        self.entries.read().get(key).and_then(|e| e.get())
    }

    pub fn get_entry(&self, key: &K) -> Option<Arc<CacheEntry<K, T>>> {
        self.entries.read().get(key).cloned()
    }

    /// Returns the entry for `key`, creating an empty one if absent. An empty
    /// entry holds no value until something is committed into it.
    pub fn get_or_create_entry(&self, key: &K) -> Arc<CacheEntry<K, T>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), None))
            .clone()
    }

    /// Locks an existing entry.
    pub async fn lock(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<LockedCacheEntry<K, T>, FailoverError> {
        let entry = self.get_entry(key).ok_or_else(|| {
            FailoverError::NotFound(format!("{}: {:?} not found", self.name, key))
        })?;
        entry.lock(timeout).await
    }

    /// Locks the entry for `key`, creating an empty one if absent.
    pub async fn lock_or_create(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<LockedCacheEntry<K, T>, FailoverError> {
        self.get_or_create_entry(key).lock(timeout).await
    }

    /// Commits one locked entry.
    pub async fn commit(&self, locked: &mut LockedCacheEntry<K, T>) -> Result<(), FailoverError> {
        self.commit_transaction(&mut [locked]).await
    }

    /// Persists the pending changes of all given locked entries as one
    /// batch, then publishes them while still locked. On failure every
    /// pending change is discarded. Callers locking several entries must
    /// lock them in ascending key order.
    pub async fn commit_transaction(
        &self,
        locked: &mut [&mut LockedCacheEntry<K, T>],
    ) -> Result<(), FailoverError> {
        let writes: Vec<StoreWrite<K, T>> =
            locked.iter().filter_map(|l| l.pending_write()).collect();

        if !writes.is_empty() {
            if let Err(e) = self.backend.commit(writes).await {
                pf_warn!(self.name; "commit failed: {}", e);
                for l in locked.iter_mut() {
                    l.discard();
                }
                return Err(FailoverError::CommitFailed(e.to_string()));
            }
        }

        for l in locked.iter_mut() {
            if l.publish() {
                self.erase(l.entry());
            }
        }
        Ok(())
    }

    /// Releases the lock of `locked`. An entry that never got a committed
    /// value is dropped from the map, unless someone else still holds it.
    pub fn release(&self, locked: LockedCacheEntry<K, T>) {
        let entry = locked.entry().clone();
        drop(locked);
        if entry.is_deleted() || entry.get().is_some() {
            return;
        }

        let mut entries = self.entries.write();
        if let Some(current) = entries.get(entry.key()) {
            // the map and `entry` itself are the only references
            if Arc::ptr_eq(current, &entry) && Arc::strong_count(&entry) == 2 {
                entries.remove(entry.key());
            }
        }
    }

    /// Number of map slots, including empty ones.
    pub fn slot_count(&self) -> usize {
        self.entries.read().len()
    }

    // removes the map slot only if it still holds this very entry
    fn erase(&self, entry: &Arc<CacheEntry<K, T>>) {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(entry.key()) {
            if Arc::ptr_eq(current, entry) {
                entries.remove(entry.key());
            }
        }
    }

    /// Keys of all entities with a committed value, sorted.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.get().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Committed snapshots of all entities, sorted by key.
    pub fn snapshot(&self) -> Vec<(K, Arc<T>)> {
        let mut items: Vec<(K, Arc<T>)> = self
            .entries
            .read()
            .iter()
            .filter_map(|(k, e)| e.get().map(|v| (k.clone(), v)))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    /// Number of entities with a committed value.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
