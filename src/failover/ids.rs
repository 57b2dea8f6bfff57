//! Identifiers shared by the manager and the agents.

use std::fmt;

use serde::{Deserialize, Serialize};

use uuid::Uuid;

/// Server node ID type.
pub type NodeId = u64;

/// Replica ID type, unique within a failover unit.
pub type ReplicaId = i64;

/// GUID of the system partition hosting the Failover Manager itself.
pub const FM_SERVICE_GUID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001);

/// A node plus the instance number of its current process incarnation. A
/// restarted node has the same `id` and a higher `instance`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeInstance {
    pub id: NodeId,
    pub instance: u64,
}

impl NodeInstance {
    pub fn new(id: NodeId, instance: u64) -> Self {
        NodeInstance { id, instance }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

/// Which failover manager instance owns something: the FMM owns the FM's
/// own partition, the FM owns everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverManagerId {
    Fm,
    Fmm,
}

impl FailoverManagerId {
    pub fn is_fmm(&self) -> bool {
        matches!(self, FailoverManagerId::Fmm)
    }
}

impl fmt::Display for FailoverManagerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailoverManagerId::Fm => write!(f, "fm"),
            FailoverManagerId::Fmm => write!(f, "fmm"),
        }
    }
}

/// Globally unique ID of a partition's replica set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FailoverUnitId(Uuid);

impl FailoverUnitId {
    /// Generates a fresh random ID.
    pub fn new() -> Self {
        FailoverUnitId(Uuid::new_v4())
    }

    pub fn from_guid(guid: Uuid) -> Self {
        FailoverUnitId(guid)
    }

    /// ID of the FM's own partition.
    pub fn fm() -> Self {
        FailoverUnitId(FM_SERVICE_GUID)
    }

    pub fn guid(&self) -> Uuid {
        self.0
    }

    pub fn is_fm(&self) -> bool {
        self.0 == FM_SERVICE_GUID
    }

    /// The failover manager instance that owns this failover unit.
    pub fn owner(&self) -> FailoverManagerId {
        if self.is_fm() {
            FailoverManagerId::Fmm
        } else {
            FailoverManagerId::Fm
        }
    }
}

impl Default for FailoverUnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // the leading 8 hex digits are plenty to tell partitions apart in logs
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}
