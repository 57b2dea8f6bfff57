//! Named sets of failover units awaiting a category of background work.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::background::RetryTimer;
use crate::failover::FailoverUnitId;
use crate::jobs::{ActionQueue, StateMachineAction};

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntitySetName {
    ReconfigurationMessageRetry,
    StateCleanup,
    ReplicaCloseMessageRetry,
    ReplicaOpenMessageRetry,
    UpdateServiceDescriptionMessageRetry,
}

impl EntitySetName {
    pub const ALL: [EntitySetName; 5] = [
        EntitySetName::ReconfigurationMessageRetry,
        EntitySetName::StateCleanup,
        EntitySetName::ReplicaCloseMessageRetry,
        EntitySetName::ReplicaOpenMessageRetry,
        EntitySetName::UpdateServiceDescriptionMessageRetry,
    ];
}

impl fmt::Display for EntitySetName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Performance counter mirroring a set's size.
#[derive(Debug, Default)]
pub struct SetSizeGauge {
    value: AtomicUsize,
}

impl SetSizeGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    fn set(&self, value: usize) {
        self.value.store(value, Ordering::Relaxed);
    }
}

/// Thread-safe set of failover unit references. Holds keys only; the
/// entities themselves live in the store.
pub struct EntitySet {
    name: EntitySetName,
    entities: Mutex<HashSet<FailoverUnitId>>,
    gauge: Option<Arc<SetSizeGauge>>,

    /// Retry timer armed when the set goes from empty to non-empty.
    retry_timer: OnceLock<Arc<RetryTimer>>,
}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EntitySet({}, {})", self.name, self.len())
    }
}

impl EntitySet {
    pub fn new(name: EntitySetName, gauge: Option<Arc<SetSizeGauge>>) -> Arc<Self> {
        Arc::new(EntitySet {
            name,
            entities: Mutex::new(HashSet::new()),
            gauge,
            retry_timer: OnceLock::new(),
        })
    }

    pub fn name(&self) -> EntitySetName {
        self.name
    }

    /// Binds the retry timer. Only the first binding takes effect.
    pub fn attach_retry_timer(&self, timer: Arc<RetryTimer>) {
        if self.retry_timer.set(timer).is_err() {
            pf_warn!(self.name; "retry timer already attached");
        }
    }

    pub fn retry_timer(&self) -> Option<&Arc<RetryTimer>> {
        self.retry_timer.get()
    }

    /// Adds `id` and returns the new size. Adding a member is a logic
    /// error: it asserts in debug builds and is a no-op otherwise.
    pub fn add_entity(&self, id: FailoverUnitId) -> usize {
        let mut entities = self.entities.lock();
        let inserted = entities.insert(id);
        debug_assert!(inserted, "{} already in set {}", id, self.name);
        if !inserted {
            pf_error!(self.name; "duplicate add of {}", id);
        }
        let size = entities.len();
        if let Some(gauge) = &self.gauge {
            gauge.set(size);
        }
        size
    }

    /// Removes `id` and returns the new size. Removing a non-member asserts
    /// in debug builds and is a no-op otherwise.
    pub fn remove_entity(&self, id: &FailoverUnitId) -> usize {
        let mut entities = self.entities.lock();
        let removed = entities.remove(id);
        debug_assert!(removed, "{} not in set {}", id, self.name);
        if !removed {
            pf_error!(self.name; "remove of non-member {}", id);
        }
        let size = entities.len();
        if let Some(gauge) = &self.gauge {
            gauge.set(size);
        }
        size
    }

    pub fn is_member(&self, id: &FailoverUnitId) -> bool {
        self.entities.lock().contains(id)
    }

    /// Point-in-time copy of the members, sorted.
    pub fn get_entities(&self) -> Vec<FailoverUnitId> {
        let mut ids: Vec<FailoverUnitId> = self.entities.lock().iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deferred membership change, applied after the owning transition has
/// been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSetMembershipAction {
    pub set: EntitySetName,
    pub id: FailoverUnitId,
    pub add: bool,
}

impl ChangeSetMembershipAction {
    /// Applies the change. The add that takes the set from empty to one
    /// member arms the retry timer; removes never disarm it, the next retry
    /// just finds nothing to do.
    pub fn apply(&self, sets: &EntitySetCollection) {
        let set = match sets.get(self.set) {
            Some(set) => set,
            None => {
                pf_warn!(self.set; "set not registered, dropping change for {}", self.id);
                return;
            }
        };

        if self.add {
            if set.add_entity(self.id) == 1 {
                if let Some(timer) = set.retry_timer() {
                    timer.set();
                }
            }
        } else {
            set.remove_entity(&self.id);
        }
    }
}

/// Per-entity membership bit of one set. Flipping it emits the matching
/// `ChangeSetMembershipAction`; setting the current value emits nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMembershipFlag {
    set: EntitySetName,
    value: bool,
}

impl SetMembershipFlag {
    pub fn new(set: EntitySetName) -> Self {
        SetMembershipFlag { set, value: false }
    }

    pub fn set_name(&self) -> EntitySetName {
        self.set
    }

    pub fn is_set(&self) -> bool {
        self.value
    }

    pub fn set_value(&mut self, id: FailoverUnitId, value: bool, queue: &mut ActionQueue) {
        if self.value == value {
            return;
        }
        self.value = value;
        queue.push(StateMachineAction::ChangeSetMembership(
            ChangeSetMembershipAction {
                set: self.set,
                id,
                add: value,
            },
        ));
    }
}

/// All entity sets of one component.
#[derive(Debug, Default)]
pub struct EntitySetCollection {
    sets: HashMap<EntitySetName, Arc<EntitySet>>,
}

impl EntitySetCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, set: Arc<EntitySet>) {
        self.sets.insert(set.name(), set);
    }

    pub fn get(&self, name: EntitySetName) -> Option<&Arc<EntitySet>> {
        self.sets.get(&name)
    }

    /// Re-enters `id` into every set whose flag is set; used when rebuilding
    /// membership from persisted entities.
    pub fn restore(&self, id: FailoverUnitId, flags: &[SetMembershipFlag]) {
        for flag in flags.iter().filter(|f| f.is_set()) {
            if let Some(set) = self.get(flag.set_name()) {
                if !set.is_member(&id) {
                    ChangeSetMembershipAction {
                        set: flag.set_name(),
                        id,
                        add: true,
                    }
                    .apply(self);
                }
            }
        }
    }
}

#[cfg(test)]
mod entity_set_tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::time::Duration;

    fn collection_with_timer() -> (EntitySetCollection, Arc<RetryTimer>, Arc<AtomicU64>) {
        let fired = Arc::new(AtomicU64::new(0));
        let fired_ref = fired.clone();
        let timer = RetryTimer::new(
            "retry",
            Box::new(|| Duration::from_secs(10)),
            Box::new(move |_| {
                fired_ref.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let set = EntitySet::new(EntitySetName::StateCleanup, Some(SetSizeGauge::new()));
        set.attach_retry_timer(timer.clone());
        let mut sets = EntitySetCollection::new();
        sets.add(set);
        (sets, timer, fired)
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn duplicate_add_keeps_size() {
        let set = EntitySet::new(EntitySetName::StateCleanup, None);
        let id = FailoverUnitId::new();
        assert_eq!(set.add_entity(id), 1);
        assert_eq!(set.add_entity(id), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn duplicate_add_asserts() {
        let set = EntitySet::new(EntitySetName::StateCleanup, None);
        let id = FailoverUnitId::new();
        set.add_entity(id);
        set.add_entity(id);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let gauge = SetSizeGauge::new();
        let set = EntitySet::new(EntitySetName::StateCleanup, Some(gauge.clone()));
        let a = FailoverUnitId::new();
        let b = FailoverUnitId::new();
        set.add_entity(a);
        set.add_entity(b);
        let snapshot = set.get_entities();
        set.remove_entity(&a);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(gauge.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn add_then_remove_restores_membership() {
        let (sets, timer, _) = collection_with_timer();
        let set = sets.get(EntitySetName::StateCleanup).unwrap().clone();
        let existing = FailoverUnitId::new();
        set.add_entity(existing);
        let before = set.get_entities();

        let id = FailoverUnitId::new();
        let mut queue = ActionQueue::new();
        let mut flag = SetMembershipFlag::new(EntitySetName::StateCleanup);
        flag.set_value(id, true, &mut queue);
        flag.set_value(id, true, &mut queue);
        flag.set_value(id, false, &mut queue);
        assert_eq!(queue.len(), 2);
        for action in queue.drain() {
            if let StateMachineAction::ChangeSetMembership(change) = action {
                change.apply(&sets);
            }
        }
        assert_eq!(set.get_entities(), before);
        assert_eq!(set.len(), 1);
        // not the first member, so no arm
        assert!(!timer.is_set());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn first_add_arms_remove_does_not_disarm() {
        let (sets, timer, fired) = collection_with_timer();
        let a = FailoverUnitId::new();
        let b = FailoverUnitId::new();
        ChangeSetMembershipAction { set: EntitySetName::StateCleanup, id: a, add: true }
            .apply(&sets);
        assert!(timer.is_set());
        let seq = timer.sequence();
        ChangeSetMembershipAction { set: EntitySetName::StateCleanup, id: b, add: true }
            .apply(&sets);
        assert_eq!(timer.sequence(), seq);
        ChangeSetMembershipAction { set: EntitySetName::StateCleanup, id: a, add: false }
            .apply(&sets);
        ChangeSetMembershipAction { set: EntitySetName::StateCleanup, id: b, add: false }
            .apply(&sets);
        assert!(timer.is_set());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn restore_from_flags() {
        let (sets, timer, _) = collection_with_timer();
        let id = FailoverUnitId::new();
        let mut queue = ActionQueue::new();
        let mut cleanup = SetMembershipFlag::new(EntitySetName::StateCleanup);
        cleanup.set_value(id, true, &mut queue);
        let open = SetMembershipFlag::new(EntitySetName::ReplicaOpenMessageRetry);
        sets.restore(id, &[cleanup, open]);
        sets.restore(id, &[cleanup, open]);
        assert!(sets.get(EntitySetName::StateCleanup).unwrap().is_member(&id));
        assert!(timer.is_set());
        timer.close();
    }
}
