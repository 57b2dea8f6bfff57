//! Entities cached by a failover manager: failover units, nodes and
//! services.

use std::fmt;
use std::time::SystemTime;

use crate::failover::{
    ConsistencyUnitDescription, FailoverUnitDescription, FailoverUnitId, NodeId,
    NodeInstance, ReplicaDescription, ReplicaId, ReplicaRole, ReplicaState,
    ServiceDescription,
};

use serde::{Deserialize, Serialize};

use uuid::Uuid;

/// Manager-side view of one partition and all of its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnit {
    /// Partition description with PC/CC epochs.
    pub description: FailoverUnitDescription,

    /// Description of the owning service.
    pub service: ServiceDescription,

    /// All known replicas, including dropped ones not yet cleaned up.
    pub replicas: Vec<ReplicaDescription>,

    /// Service deleted; replicas are being deleted.
    pub is_to_be_deleted: bool,

    /// Result of the last placement pass.
    pub replica_difference: i32,

    /// Next replica ID to hand out.
    pub next_replica_id: ReplicaId,

    /// Time quorum loss was first observed, if quorum is currently lost.
    pub quorum_loss_time: Option<SystemTime>,

    /// Bumped on every committed change.
    pub update_version: u64,
}

impl FailoverUnit {
    pub fn new(failover_unit_id: FailoverUnitId, service: ServiceDescription) -> Self {
        let description = FailoverUnitDescription::new(
            failover_unit_id,
            ConsistencyUnitDescription::singleton(Uuid::new_v4()),
            service.target_replica_set_size,
            service.min_replica_set_size,
        );
        FailoverUnit {
            description,
            service,
            replicas: vec![],
            is_to_be_deleted: false,
            replica_difference: 0,
            next_replica_id: 1,
            quorum_loss_time: None,
            update_version: 0,
        }
    }

    pub fn id(&self) -> FailoverUnitId {
        self.description.failover_unit_id
    }

    pub fn target(&self) -> u32 {
        self.description.target_replica_set_size
    }

    pub fn is_changing_configuration(&self) -> bool {
        self.description.is_reconfiguration_in_progress()
    }

    /// No built replica is in the configuration. A primary still being
    /// built does not count.
    pub fn is_configuration_empty(&self) -> bool {
        !self
            .replicas
            .iter()
            .any(|r| r.is_in_configuration() && !r.is_in_build())
    }

    pub fn is_quorum_lost(&self) -> bool {
        self.quorum_loss_time.is_some()
    }

    pub fn primary(&self) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.cc_role == ReplicaRole::Primary)
    }

    /// Current configuration members.
    pub fn members(&self) -> impl Iterator<Item = &ReplicaDescription> {
        self.replicas.iter().filter(|r| r.is_in_configuration())
    }

    pub fn replica_on(&self, node: NodeId) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.node.id == node)
    }

    pub fn replica_on_mut(&mut self, node: NodeId) -> Option<&mut ReplicaDescription> {
        self.replicas.iter_mut().find(|r| r.node.id == node)
    }

    /// Finds the replica a reply is about; a reply from an older replica
    /// on the same node does not match.
    pub fn find_replica_mut(
        &mut self,
        node: NodeId,
        replica_id: ReplicaId,
    ) -> Option<&mut ReplicaDescription> {
        self.replicas
            .iter_mut()
            .find(|r| r.node.id == node && r.replica_id == replica_id)
    }

    pub fn hosts_replica_on(&self, node: NodeId) -> bool {
        self.replicas.iter().any(|r| r.node.id == node && !r.is_deleted)
    }

    /// Adds an InBuild replica on `node` and returns its ID.
    pub fn add_replica(
        &mut self,
        node: NodeInstance,
        cc_role: ReplicaRole,
        now: SystemTime,
    ) -> ReplicaId {
        let replica_id = self.next_replica_id;
        self.next_replica_id += 1;
        self.replicas
            .push(ReplicaDescription::new_in_build(node, replica_id, cc_role, now));
        replica_id
    }

    pub fn remove_replica(&mut self, node: NodeId, replica_id: ReplicaId) -> bool {
        let before = self.replicas.len();
        self.replicas
            .retain(|r| !(r.node.id == node && r.replica_id == replica_id));
        self.replicas.len() != before
    }

    /// Number of up and ready configuration members.
    pub fn available_count(&self) -> usize {
        self.members().filter(|r| r.is_available()).count()
    }

    /// A partition is unhealthy while quorum is lost, while reconfiguring,
    /// or while below its target size.
    pub fn is_unhealthy(&self) -> bool {
        self.is_quorum_lost()
            || self.is_changing_configuration()
            || self.available_count() < self.target() as usize
    }

    /// Replicas a configuration message carries: everything in PC or CC.
    pub fn configuration_replicas(&self) -> Vec<ReplicaDescription> {
        self.replicas
            .iter()
            .filter(|r| r.is_in_configuration() || r.is_in_previous_configuration())
            .cloned()
            .collect()
    }

    pub(crate) fn bump_version(&mut self) {
        self.update_version += 1;
    }
}

impl fmt::Display for FailoverUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.description, self.service.name)?;
        if self.is_to_be_deleted {
            write!(f, " ToBeDeleted")?;
        }
        for r in &self.replicas {
            write!(f, " {}", r)?;
        }
        Ok(())
    }
}

/// Manager-side view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: NodeInstance,
    pub is_up: bool,

    /// Intended activation state, last sent to the node.
    pub is_activated: bool,

    /// Sequence number of the last activation change.
    pub activation_sequence: i64,

    /// The node acknowledged the last activation change.
    pub is_activation_acked: bool,

    pub last_down_time: Option<SystemTime>,
}

impl NodeInfo {
    pub fn new(node: NodeInstance) -> Self {
        NodeInfo {
            node,
            is_up: true,
            is_activated: true,
            activation_sequence: 0,
            is_activation_acked: true,
            last_down_time: None,
        }
    }

    /// May new replicas be placed on this node?
    pub fn is_placeable(&self) -> bool {
        self.is_up && self.is_activated
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}#{}",
            self.node,
            if self.is_up { "Up" } else { "Down" },
            if self.is_activated {
                "Activated"
            } else {
                "Deactivated"
            },
            self.activation_sequence
        )
    }
}

/// Manager-side view of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub description: ServiceDescription,
    pub failover_units: Vec<FailoverUnitId>,
}

/// Replica state as shown by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaQueryResult {
    pub node: NodeId,
    pub replica_id: ReplicaId,
    pub role: ReplicaRole,
    pub state: ReplicaState,
    pub is_up: bool,
}

impl From<&ReplicaDescription> for ReplicaQueryResult {
    fn from(r: &ReplicaDescription) -> Self {
        ReplicaQueryResult {
            node: r.node.id,
            replica_id: r.replica_id,
            role: r.cc_role,
            state: r.state,
            is_up: r.is_up,
        }
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    fn unit(target: u32) -> FailoverUnit {
        FailoverUnit::new(
            FailoverUnitId::new(),
            ServiceDescription::new_stateful("svc", 1, target, target.min(2)),
        )
    }

    #[test]
    fn replica_ids_increase() {
        let now = SystemTime::now();
        let mut fu = unit(3);
        let a = fu.add_replica(NodeInstance::new(1, 1), ReplicaRole::Primary, now);
        let b = fu.add_replica(NodeInstance::new(2, 1), ReplicaRole::Idle, now);
        assert!(b > a);
        assert!(fu.is_configuration_empty());
        assert!(fu.hosts_replica_on(2));
        assert!(fu.remove_replica(2, b));
        assert!(!fu.remove_replica(2, b));
        assert!(!fu.hosts_replica_on(2));
    }

    #[test]
    fn unhealthy_below_target() {
        let now = SystemTime::now();
        let mut fu = unit(1);
        assert!(fu.is_unhealthy());
        fu.add_replica(NodeInstance::new(1, 1), ReplicaRole::Primary, now);
        fu.replicas[0].state = ReplicaState::Ready;
        assert!(!fu.is_unhealthy());
        assert_eq!(fu.primary().map(|r| r.node.id), Some(1));
    }
}
