//! Failover manager: authoritative partition state, placement, and the
//! per-partition state machine.

mod cache;
mod fm;
mod placement;
mod tasks;

pub use cache::{FailoverUnit, NodeInfo, ReplicaQueryResult, ServiceInfo};
pub use fm::{FailoverManager, ManagerBackends};
pub use placement::{
    apply_replica_difference, compute_replica_difference, run_placement_task,
    select_nodes, PlacementContext, PlacementCounts,
};
pub use tasks::{
    on_add_replica_reply, on_delete_replica_reply, on_do_reconfiguration_reply,
    pending_task, reconfiguration_task, state_update_task, TaskContext,
};
