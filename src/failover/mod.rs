//! Replica set data model shared by the failover manager and the agents.

mod description;
mod epoch;
mod ids;
mod replica;

pub use description::{
    ConsistencyUnitDescription, FailoverUnitDescription, PartitionKind,
    ServiceDescription,
};
pub use epoch::Epoch;
pub use ids::{
    FailoverManagerId, FailoverUnitId, NodeId, NodeInstance, ReplicaId,
    FM_SERVICE_GUID,
};
pub use replica::{ReplicaDescription, ReplicaRole, ReplicaState};

/// Number of replicas needed for a write quorum out of `n`.
pub fn write_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Number of replicas needed for a read quorum out of `n`.
pub fn read_quorum(n: usize) -> usize {
    (n + 1) / 2
}

#[cfg(test)]
mod quorum_tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(write_quorum(1), 1);
        assert_eq!(write_quorum(3), 2);
        assert_eq!(write_quorum(4), 3);
        assert_eq!(read_quorum(3), 2);
        assert_eq!(read_quorum(4), 2);
    }
}
