//! Per-failover-unit load snapshot with its persistence state machine.

use crate::failover::FailoverUnitId;
use crate::store::StoreWrite;
use crate::utils::FailoverError;

use serde::{Deserialize, Serialize};

/// Reported load and move cost of one failover unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub primary_load: u32,
    pub secondary_load: u32,
    pub move_cost: u32,
}

/// What the next persist of a `LoadInfo` has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceState {
    NoChange,
    ToBeInserted,
    ToBeUpdated,
    ToBeDeleted,
}

/// Load snapshot of one failover unit.
///
/// `is_pending` means there is a change not yet handed to a persist;
/// `is_updating` means a persist is in flight. `start_persist()` moves
/// pending to updating, and only `on_persist_completed()` clears updating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadInfo {
    failover_unit_id: FailoverUnitId,
    metrics: LoadMetrics,
    persistence_state: PersistenceState,
    is_pending: bool,
    is_updating: bool,

    /// Does a durable record exist?
    persisted: bool,

    /// Persistence state handed to the in-flight persist.
    in_flight: Option<PersistenceState>,
}

impl LoadInfo {
    /// A fresh load record awaiting its first insert.
    pub fn new(failover_unit_id: FailoverUnitId, metrics: LoadMetrics) -> Self {
        LoadInfo {
            failover_unit_id,
            metrics,
            persistence_state: PersistenceState::ToBeInserted,
            is_pending: true,
            is_updating: false,
            persisted: false,
            in_flight: None,
        }
    }

    /// A record reloaded from durable storage.
    pub fn recovered(failover_unit_id: FailoverUnitId, metrics: LoadMetrics) -> Self {
        LoadInfo {
            failover_unit_id,
            metrics,
            persistence_state: PersistenceState::NoChange,
            is_pending: false,
            is_updating: false,
            persisted: true,
            in_flight: None,
        }
    }

    pub fn failover_unit_id(&self) -> FailoverUnitId {
        self.failover_unit_id
    }

    pub fn metrics(&self) -> LoadMetrics {
        self.metrics
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.persistence_state
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending
    }

    pub fn is_updating(&self) -> bool {
        self.is_updating
    }

    /// Has a delete been persisted?
    pub fn is_deleted(&self) -> bool {
        !self.persisted
            && !self.is_pending
            && !self.is_updating
            && self.persistence_state == PersistenceState::NoChange
            && self.in_flight.is_none()
    }

    /// Records newly reported metrics.
    pub fn update(&mut self, metrics: LoadMetrics) {
        if self.persistence_state != PersistenceState::ToBeDeleted && self.metrics == metrics {
            return;
        }
        self.metrics = metrics;
        self.persistence_state = if self.persisted {
            PersistenceState::ToBeUpdated
        } else {
            PersistenceState::ToBeInserted
        };
        self.is_pending = true;
    }

    /// Requests deletion of the durable record.
    pub fn mark_for_delete(&mut self) {
        self.persistence_state = PersistenceState::ToBeDeleted;
        self.is_pending = true;
    }

    /// Hands the pending change to a persist. Requires `is_pending` and no
    /// persist in flight. Returns the write to persist, or `None` when the
    /// change needs no durable write (deleting a never-inserted record).
    pub fn start_persist(
        &mut self,
    ) -> Result<Option<StoreWrite<FailoverUnitId, LoadMetrics>>, FailoverError> {
        if !self.is_pending || self.is_updating {
            return Err(FailoverError::InvalidState(format!(
                "load {} cannot start persist: pending {} updating {}",
                self.failover_unit_id, self.is_pending, self.is_updating
            )));
        }

        self.is_pending = false;
        self.is_updating = true;
        self.in_flight = Some(self.persistence_state);

        let write = match self.persistence_state {
            PersistenceState::NoChange => None,
            PersistenceState::ToBeInserted | PersistenceState::ToBeUpdated => {
                Some(StoreWrite {
                    key: self.failover_unit_id,
                    value: Some(self.metrics),
                })
            }
            PersistenceState::ToBeDeleted if self.persisted => Some(StoreWrite {
                key: self.failover_unit_id,
                value: None,
            }),
            PersistenceState::ToBeDeleted => None,
        };
        Ok(write)
    }

    /// Ends the in-flight persist. On failure the change becomes pending
    /// again so the next flush retries it.
    pub fn on_persist_completed(&mut self, success: bool) -> Result<(), FailoverError> {
        let in_flight = match self.in_flight.take() {
            Some(s) if self.is_updating => s,
            _ => {
                return Err(FailoverError::InvalidState(format!(
                    "load {} has no persist in flight",
                    self.failover_unit_id
                )))
            }
        };
        self.is_updating = false;

        if !success {
            self.is_pending = true;
            return Ok(());
        }

        match in_flight {
            PersistenceState::ToBeInserted | PersistenceState::ToBeUpdated => {
                self.persisted = true
            }
            PersistenceState::ToBeDeleted => self.persisted = false,
            PersistenceState::NoChange => {}
        }

        if !self.is_pending {
            self.persistence_state = PersistenceState::NoChange;
        } else if self.persisted && self.persistence_state == PersistenceState::ToBeInserted {
            // a newer update arrived before the insert landed
            self.persistence_state = PersistenceState::ToBeUpdated;
        }
        Ok(())
    }
}

#[cfg(test)]
mod load_tests {
    use super::*;

    fn metrics(p: u32) -> LoadMetrics {
        LoadMetrics {
            primary_load: p,
            secondary_load: p / 2,
            move_cost: 1,
        }
    }

    #[test]
    fn insert_then_update() -> Result<(), FailoverError> {
        let mut load = LoadInfo::new(FailoverUnitId::new(), metrics(10));
        assert!(load.is_pending());
        let write = load.start_persist()?.unwrap();
        assert_eq!(write.value, Some(metrics(10)));
        assert!(load.is_updating() && !load.is_pending());
        load.on_persist_completed(true)?;
        assert_eq!(load.persistence_state(), PersistenceState::NoChange);

        load.update(metrics(20));
        assert_eq!(load.persistence_state(), PersistenceState::ToBeUpdated);
        load.update(metrics(20));
        assert!(load.is_pending());
        Ok(())
    }

    #[test]
    fn start_requires_pending_not_updating() -> Result<(), FailoverError> {
        let mut load = LoadInfo::recovered(FailoverUnitId::new(), metrics(1));
        assert!(load.start_persist().is_err());
        load.update(metrics(2));
        load.start_persist()?;
        load.update(metrics(3));
        // still in flight
        assert!(load.start_persist().is_err());
        load.on_persist_completed(true)?;
        assert!(load.is_pending());
        assert_eq!(load.start_persist()?.unwrap().value, Some(metrics(3)));
        Ok(())
    }

    #[test]
    fn update_during_insert_becomes_update() -> Result<(), FailoverError> {
        let mut load = LoadInfo::new(FailoverUnitId::new(), metrics(1));
        load.start_persist()?;
        load.update(metrics(5));
        assert_eq!(load.persistence_state(), PersistenceState::ToBeInserted);
        load.on_persist_completed(true)?;
        assert_eq!(load.persistence_state(), PersistenceState::ToBeUpdated);
        Ok(())
    }

    #[test]
    fn failed_persist_retries() -> Result<(), FailoverError> {
        let mut load = LoadInfo::new(FailoverUnitId::new(), metrics(1));
        load.start_persist()?;
        load.on_persist_completed(false)?;
        assert!(load.is_pending() && !load.is_updating());
        assert_eq!(load.persistence_state(), PersistenceState::ToBeInserted);
        assert!(load.on_persist_completed(true).is_err());
        Ok(())
    }

    #[test]
    fn delete_lifecycle() -> Result<(), FailoverError> {
        let mut load = LoadInfo::recovered(FailoverUnitId::new(), metrics(1));
        load.mark_for_delete();
        assert_eq!(load.start_persist()?.unwrap().value, None);
        assert!(!load.is_deleted());
        load.on_persist_completed(true)?;
        assert!(load.is_deleted());

        let mut never = LoadInfo::new(FailoverUnitId::new(), metrics(1));
        never.mark_for_delete();
        assert!(never.start_persist()?.is_none());
        never.on_persist_completed(true)?;
        assert!(never.is_deleted());
        Ok(())
    }
}
