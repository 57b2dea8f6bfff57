//! Lockable cache entry with copy-on-write snapshots.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::store::StoreWrite;
use crate::utils::FailoverError;

use parking_lot::RwLock;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{self, Duration};

/// One cached entity. Readers get the last committed snapshot without
/// locking; writers must go through `lock()` and a `LockedCacheEntry`.
pub struct CacheEntry<K, T> {
    key: K,

    /// Writer lock; waiters queue on it fairly.
    lock: Arc<Mutex<()>>,

    /// Last committed value. Replaced wholesale on commit, never mutated in
    /// place.
    snapshot: RwLock<Option<Arc<T>>>,

    /// Tombstone set once a delete has been committed.
    deleted: AtomicBool,
}

impl<K, T> fmt::Debug for CacheEntry<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("deleted", &self.deleted.load(Ordering::Acquire))
            .finish()
    }
}

impl<K, T> CacheEntry<K, T>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: K, value: Option<T>) -> Arc<Self> {
        Arc::new(CacheEntry {
            key,
            lock: Arc::new(Mutex::new(())),
            snapshot: RwLock::new(value.map(Arc::new)),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Last committed value, if any.
    pub fn get(&self) -> Option<Arc<T>> {
        if self.is_deleted() {
            return None;
        }
        self.snapshot.read().clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Is some writer currently holding the lock?
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Acquires exclusive access, waiting at most `timeout`. The returned
    /// handle may refer to an entry that was deleted while waiting; callers
    /// must check `is_deleted()` before acting.
    pub async fn lock(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<LockedCacheEntry<K, T>, FailoverError> {
        let guard = match time::timeout(timeout, self.lock.clone().lock_owned()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                return Err(FailoverError::Timeout(format!(
                    "lock on {:?} not acquired within {} ms",
                    self.key,
                    timeout.as_millis()
                )))
            }
        };

        let committed = self.snapshot.read().clone();
        Ok(LockedCacheEntry {
            entry: self.clone(),
            _guard: guard,
            committed,
            pending: Pending::None,
        })
    }

    fn publish(&self, value: Option<Arc<T>>) {
        match value {
            Some(v) => *self.snapshot.write() = Some(v),
            None => {
                *self.snapshot.write() = None;
                self.deleted.store(true, Ordering::Release);
            }
        }
    }
}

/// Uncommitted change held by a locked entry.
enum Pending<T> {
    None,
    Update(T),
    Delete,
}

/// Exclusive handle on a `CacheEntry`. Dropping it releases the lock and
/// discards any uncommitted change.
pub struct LockedCacheEntry<K, T> {
    entry: Arc<CacheEntry<K, T>>,
    _guard: OwnedMutexGuard<()>,

    /// Snapshot at lock time; only the lock holder can replace it.
    committed: Option<Arc<T>>,

    pending: Pending<T>,
}

impl<K, T> fmt::Debug for LockedCacheEntry<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockedCacheEntry")
            .field("key", &self.entry.key)
            .field("updating", &!matches!(self.pending, Pending::None))
            .finish()
    }
}

impl<K, T> LockedCacheEntry<K, T>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.entry.key
    }

    pub fn entry(&self) -> &Arc<CacheEntry<K, T>> {
        &self.entry
    }

    /// Was the entity deleted, possibly while this handle was waiting?
    pub fn is_deleted(&self) -> bool {
        self.entry.is_deleted()
    }

    /// Last committed value.
    pub fn committed(&self) -> Option<&Arc<T>> {
        self.committed.as_ref()
    }

    /// Current view: the pending value if updating, else the committed one.
    pub fn get(&self) -> Option<&T> {
        match &self.pending {
            Pending::Update(v) => Some(v),
            Pending::Delete => None,
            Pending::None => self.committed.as_deref(),
        }
    }

    /// Does the entity exist in the current view?
    pub fn exists(&self) -> bool {
        !self.is_deleted() && self.get().is_some()
    }

    pub fn is_updating(&self) -> bool {
        !matches!(self.pending, Pending::None)
    }

    pub fn is_marked_for_delete(&self) -> bool {
        matches!(self.pending, Pending::Delete)
    }

    /// Starts (or continues) an update and returns the mutable working
    /// copy. Returns `None` if there is nothing to update.
    pub fn enable_update(&mut self) -> Option<&mut T> {
        if let Pending::None = self.pending {
            match &self.committed {
                Some(v) => self.pending = Pending::Update(T::clone(v)),
                None => return None,
            }
        }
        match &mut self.pending {
            Pending::Update(v) => Some(v),
            _ => None,
        }
    }

    /// Replaces the whole value, creating the entity if it did not exist.
    pub fn set(&mut self, value: T) {
        self.pending = Pending::Update(value);
    }

    /// Marks the entity for deletion at the next commit.
    pub fn mark_for_delete(&mut self) {
        self.pending = Pending::Delete;
    }

    /// Drops the uncommitted change, rolling back to the committed value.
    pub fn discard(&mut self) {
        self.pending = Pending::None;
    }

    /// The write this handle would persist on commit.
    pub(crate) fn pending_write(&self) -> Option<StoreWrite<K, T>> {
        match &self.pending {
            Pending::None => None,
            Pending::Update(v) => Some(StoreWrite {
                key: self.entry.key.clone(),
                value: Some(v.clone()),
            }),
            Pending::Delete => {
                if self.committed.is_none() {
                    // never persisted, nothing to delete durably
                    None
                } else {
                    Some(StoreWrite {
                        key: self.entry.key.clone(),
                        value: None,
                    })
                }
            }
        }
    }

    /// Publishes the pending change after it has been persisted. Returns
    /// true if the entity got deleted.
    pub(crate) fn publish(&mut self) -> bool {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => false,
            Pending::Update(v) => {
                let v = Arc::new(v);
                self.entry.publish(Some(v.clone()));
                self.committed = Some(v);
                false
            }
            Pending::Delete => {
                self.entry.publish(None);
                self.committed = None;
                true
            }
        }
    }
}
