//! Agent-side view of one failover unit: the local replica and, while it
//! is reconfiguring as primary, the configuration it drives.

use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use crate::agent::ReplicaCloseMode;
use crate::background::{EntitySetName, SetMembershipFlag};
use crate::failover::{
    read_quorum, FailoverManagerId, FailoverUnitDescription, FailoverUnitId,
    NodeId, ReplicaDescription, ReplicaRole, ReplicaState, ServiceDescription,
};
use crate::health::FailureCounter;
use crate::messaging::Endpoint;

use serde::{Deserialize, Serialize};

/// Phase of a reconfiguration driven by the local primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationStage {
    None,
    Phase0Demote,
    Phase1GetLsn,
    Phase2Catchup,
    Phase3Deactivate,
    Phase4Activate,
    AbortPhase0Demote,
}

impl fmt::Display for ReconfigurationStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why the local replica is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaOpenMode {
    /// Built for the FM, which gets a reply.
    New,

    /// Reopening a replica that went down; nobody is waiting on it.
    Reopen,
}

/// One failover unit as known to the agent of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFailoverUnit {
    pub description: FailoverUnitDescription,
    pub service: ServiceDescription,

    /// This node's replica.
    pub local_replica: ReplicaDescription,

    /// Configuration being driven while reconfiguring as primary.
    pub replicas: Vec<ReplicaDescription>,

    pub reconfiguration_stage: ReconfigurationStage,

    pub open_mode: Option<ReplicaOpenMode>,
    pub close_mode: Option<ReplicaCloseMode>,

    /// Who asked for the pending close, if it needs a reply.
    pub sender: Option<Endpoint>,

    /// The local replica is not running.
    pub is_closed: bool,

    /// Deleted by the FM; kept as a tombstone until cleaned up.
    pub is_deleted: bool,
    pub deleted_time: Option<SystemTime>,

    pub open_pending: SetMembershipFlag,
    pub close_pending: SetMembershipFlag,
    pub message_retry: SetMembershipFlag,
    pub cleanup_pending: SetMembershipFlag,
    pub service_update_pending: SetMembershipFlag,

    /// Nodes that have not answered the current reconfiguration phase.
    pub awaiting: BTreeSet<NodeId>,

    /// Nodes that answered GetLSN.
    pub lsn_replied: BTreeSet<NodeId>,

    pub open_failures: FailureCounter,
    pub close_failures: FailureCounter,
}

impl LocalFailoverUnit {
    /// A unit whose local replica is about to be opened for the FM.
    pub fn new(
        description: FailoverUnitDescription,
        service: ServiceDescription,
        local_replica: ReplicaDescription,
    ) -> Self {
        LocalFailoverUnit {
            description,
            service,
            local_replica,
            replicas: vec![],
            reconfiguration_stage: ReconfigurationStage::None,
            open_mode: Some(ReplicaOpenMode::New),
            close_mode: None,
            sender: None,
            is_closed: false,
            is_deleted: false,
            deleted_time: None,
            open_pending: SetMembershipFlag::new(EntitySetName::ReplicaOpenMessageRetry),
            close_pending: SetMembershipFlag::new(EntitySetName::ReplicaCloseMessageRetry),
            message_retry: SetMembershipFlag::new(EntitySetName::ReconfigurationMessageRetry),
            cleanup_pending: SetMembershipFlag::new(EntitySetName::StateCleanup),
            service_update_pending: SetMembershipFlag::new(
                EntitySetName::UpdateServiceDescriptionMessageRetry,
            ),
            awaiting: BTreeSet::new(),
            lsn_replied: BTreeSet::new(),
            open_failures: FailureCounter::default(),
            close_failures: FailureCounter::default(),
        }
    }

    pub fn id(&self) -> FailoverUnitId {
        self.description.failover_unit_id
    }

    pub fn owner(&self) -> FailoverManagerId {
        self.id().owner()
    }

    pub fn flags(&self) -> [SetMembershipFlag; 5] {
        [
            self.open_pending,
            self.close_pending,
            self.message_retry,
            self.cleanup_pending,
            self.service_update_pending,
        ]
    }

    /// Open and not on its way down.
    pub fn is_open(&self) -> bool {
        !self.is_closed && !self.close_pending.is_set()
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguration_stage != ReconfigurationStage::None
    }

    /// Has the close requested with `mode` completed?
    pub fn is_closed_with(&self, mode: ReplicaCloseMode) -> bool {
        self.is_closed && self.close_mode == Some(mode)
    }

    pub fn replica_on_mut(&mut self, node: NodeId) -> Option<&mut ReplicaDescription> {
        self.replicas.iter_mut().find(|r| r.node.id == node)
    }

    /// Members of the previous configuration.
    pub fn previous_configuration(&self) -> impl Iterator<Item = &ReplicaDescription> {
        self.replicas.iter().filter(|r| r.is_in_previous_configuration())
    }

    /// GetLSN replies, counting the local replica, reached a read quorum of
    /// the previous configuration. A unit without a previous configuration
    /// needs no replies.
    pub fn has_read_quorum(&self) -> bool {
        let pc_size = self.previous_configuration().count();
        if pc_size == 0 {
            return true;
        }
        let local = self.local_replica.node.id;
        let replied = self
            .previous_configuration()
            .filter(|r| r.node.id == local || self.lsn_replied.contains(&r.node.id))
            .count();
        replied >= read_quorum(pc_size)
    }

    /// Replica description sent in replies: the local replica with its
    /// current state and sequence number.
    pub fn reply_replica(&self) -> ReplicaDescription {
        self.local_replica.clone()
    }

    /// Local replica as seen after a delete or failed open.
    pub fn dropped_replica(&self) -> ReplicaDescription {
        let mut replica = self.local_replica.clone();
        replica.state = ReplicaState::Dropped;
        replica.cc_role = ReplicaRole::None;
        replica.is_up = false;
        replica
    }
}

impl fmt::Display for LocalFailoverUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.description, self.local_replica)?;
        if self.is_reconfiguring() {
            write!(f, " {}", self.reconfiguration_stage)?;
        }
        if self.is_closed {
            write!(f, " Closed")?;
        }
        if self.is_deleted {
            write!(f, " Deleted")?;
        }
        Ok(())
    }
}

/// A local replica as shown by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalReplicaQueryResult {
    pub failover_unit_id: FailoverUnitId,
    pub service_name: String,
    pub replica_id: i64,
    pub role: ReplicaRole,
    pub state: ReplicaState,
    pub lsn: i64,
    pub is_open: bool,
    pub is_deleted: bool,
    pub reconfiguration_stage: ReconfigurationStage,
}

impl From<&LocalFailoverUnit> for LocalReplicaQueryResult {
    fn from(fu: &LocalFailoverUnit) -> Self {
        LocalReplicaQueryResult {
            failover_unit_id: fu.id(),
            service_name: fu.service.name.clone(),
            replica_id: fu.local_replica.replica_id,
            role: fu.local_replica.cc_role,
            state: fu.local_replica.state,
            lsn: fu.local_replica.lsn,
            is_open: fu.is_open() && !fu.open_pending.is_set(),
            is_deleted: fu.is_deleted,
            reconfiguration_stage: fu.reconfiguration_stage,
        }
    }
}
