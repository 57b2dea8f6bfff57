//! Lock / transition / commit / act sequence shared by all entity job
//! items.

use std::fmt;
use std::hash::Hash;

use crate::jobs::{ActionExecutor, ActionQueue, ComponentState, JobItemCheck};
use crate::store::{EntityStore, LockedCacheEntry};
use crate::utils::FailoverError;

use tokio::time::Duration;

/// Whether a job item's transition actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    Skipped,
}

/// Runs one transition against the entity at `key`:
///
/// 1. checks the component state against `check`;
/// 2. locks the entity, waiting at most `lock_timeout`; an empty slot is
///    created for absent entities unless `check` requires one to exist;
/// 3. skips tombstoned entities, and missing ones if `check` requires one;
/// 4. runs `transition`, which edits the locked entry and queues actions;
/// 5. commits if anything changed;
/// 6. releases the lock and executes the queued actions.
///
/// An error from `transition` or from the commit discards both the change
/// and the actions.
pub async fn run_state_machine_job<K, T, F>(
    store: &EntityStore<K, T>,
    key: &K,
    check: JobItemCheck,
    component: ComponentState,
    lock_timeout: Duration,
    executor: &dyn ActionExecutor,
    transition: F,
) -> Result<JobOutcome, FailoverError>
where
    K: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    F: FnOnce(&mut LockedCacheEntry<K, T>, &mut ActionQueue) -> Result<(), FailoverError>,
{
    if !check.allows_component(component) {
        return Ok(JobOutcome::Skipped);
    }

    let mut locked = if check.requires_entity() {
        match store.get_entry(key) {
            Some(entry) => entry.lock(lock_timeout).await?,
            None => return Ok(JobOutcome::Skipped),
        }
    } else {
        store.lock_or_create(key, lock_timeout).await?
    };
    if locked.is_deleted() {
        pf_trace!("jobs"; "{:?} deleted while waiting for lock", key);
        return Ok(JobOutcome::Skipped);
    }
    if check.requires_entity() && !locked.exists() {
        store.release(locked);
        return Ok(JobOutcome::Skipped);
    }

    let mut actions = ActionQueue::new();
    let result = match transition(&mut locked, &mut actions) {
        Ok(()) if locked.is_updating() => store.commit(&mut locked).await,
        res => res,
    };
    // an empty slot created for this job does not outlive it
    store.release(locked);
    result?;

    actions.execute(executor);
    Ok(JobOutcome::Processed)
}
