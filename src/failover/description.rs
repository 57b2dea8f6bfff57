//! Failover unit and service descriptions.

use std::fmt;

use crate::failover::{Epoch, FailoverUnitId};

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

use uuid::Uuid;

/// How a partition divides the service's key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    Singleton,
    Int64Range { low: i64, high: i64 },
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyUnitDescription {
    pub consistency_unit_id: Uuid,
    pub kind: PartitionKind,
}

impl ConsistencyUnitDescription {
    pub fn singleton(consistency_unit_id: Uuid) -> Self {
        ConsistencyUnitDescription {
            consistency_unit_id,
            kind: PartitionKind::Singleton,
        }
    }
}

/// Replica set description of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub failover_unit_id: FailoverUnitId,
    pub consistency_unit_description: ConsistencyUnitDescription,
    /// Current configuration epoch.
    pub cc_epoch: Epoch,
    /// Previous configuration epoch; invalid unless reconfiguring.
    pub pc_epoch: Epoch,
    pub target_replica_set_size: u32,
    pub min_replica_set_size: u32,
}

impl FailoverUnitDescription {
    pub fn new(
        failover_unit_id: FailoverUnitId,
        consistency_unit_description: ConsistencyUnitDescription,
        target_replica_set_size: u32,
        min_replica_set_size: u32,
    ) -> Self {
        FailoverUnitDescription {
            failover_unit_id,
            consistency_unit_description,
            cc_epoch: Epoch::invalid(),
            pc_epoch: Epoch::invalid(),
            target_replica_set_size,
            min_replica_set_size,
        }
    }

    pub fn is_reconfiguration_in_progress(&self) -> bool {
        self.pc_epoch.is_valid()
    }

    pub fn is_data_loss_between_pc_and_cc(&self) -> bool {
        self.pc_epoch.is_valid()
            && self.pc_epoch.data_loss_version != self.cc_epoch.data_loss_version
    }

    pub fn is_primary_change_between_pc_and_cc(&self) -> bool {
        self.pc_epoch.is_valid()
            && self.pc_epoch.primary_epoch() != self.cc_epoch.primary_epoch()
    }
}

impl fmt::Display for FailoverUnitDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}/{}",
            self.failover_unit_id,
            self.target_replica_set_size,
            self.min_replica_set_size,
            self.pc_epoch,
            self.cc_epoch
        )
    }
}

/// Description of a service and its partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub is_stateful: bool,
    pub partition_count: u32,
    pub target_replica_set_size: u32,
    pub min_replica_set_size: u32,
    /// Per-service override of the replica restart grace period.
    pub replica_restart_wait_duration_ms: Option<u64>,
    /// Bumped on every description update.
    pub update_version: u64,
}

impl ServiceDescription {
    pub fn new_stateful(
        name: impl Into<String>,
        partition_count: u32,
        target_replica_set_size: u32,
        min_replica_set_size: u32,
    ) -> Self {
        ServiceDescription {
            name: name.into(),
            is_stateful: true,
            partition_count,
            target_replica_set_size,
            min_replica_set_size,
            replica_restart_wait_duration_ms: None,
            update_version: 0,
        }
    }

    /// Grace period for this service's down replicas.
    pub fn replica_restart_wait_duration(&self, default: Duration) -> Duration {
        self.replica_restart_wait_duration_ms
            .map_or(default, Duration::from_millis)
    }
}
