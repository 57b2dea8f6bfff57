//! Per-replica description within a replica set.

use std::fmt;
use std::time::SystemTime;

use crate::failover::{NodeInstance, ReplicaId};

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Role of a replica in a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    None,
    Idle,
    Secondary,
    Primary,
}

impl ReplicaRole {
    fn abbrev(&self) -> &'static str {
        match self {
            ReplicaRole::None => "N",
            ReplicaRole::Idle => "I",
            ReplicaRole::Secondary => "S",
            ReplicaRole::Primary => "P",
        }
    }
}

/// Build/lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    InBuild,
    Ready,
    StandBy,
    Dropped,
}

impl ReplicaState {
    fn abbrev(&self) -> &'static str {
        match self {
            ReplicaState::InBuild => "IB",
            ReplicaState::Ready => "RD",
            ReplicaState::StandBy => "SB",
            ReplicaState::Dropped => "DD",
        }
    }
}

/// One replica of a failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    /// Node instance hosting the replica.
    pub node: NodeInstance,

    /// Replica ID, unique within the failover unit.
    pub replica_id: ReplicaId,

    /// Incarnation of the replica, bumped on every reopen.
    pub instance_id: i64,

    /// Role in the previous configuration.
    pub pc_role: ReplicaRole,

    /// Role in the current configuration.
    pub cc_role: ReplicaRole,

    pub state: ReplicaState,

    pub is_up: bool,

    pub is_to_be_dropped: bool,
    pub is_primary_to_be_swapped_out: bool,
    pub is_to_be_promoted: bool,
    pub is_pending_remove: bool,
    pub is_deleted: bool,

    /// When the replica was last seen going down.
    pub last_down_time: Option<SystemTime>,

    /// When the replica was last seen coming up.
    pub last_up_time: Option<SystemTime>,

    /// Last sequence number the replica reported as committed.
    pub lsn: i64,
}

impl ReplicaDescription {
    /// A new replica being built on `node`.
    pub fn new_in_build(
        node: NodeInstance,
        replica_id: ReplicaId,
        cc_role: ReplicaRole,
        now: SystemTime,
    ) -> Self {
        ReplicaDescription {
            node,
            replica_id,
            instance_id: 1,
            pc_role: ReplicaRole::None,
            cc_role,
            state: ReplicaState::InBuild,
            is_up: true,
            is_to_be_dropped: false,
            is_primary_to_be_swapped_out: false,
            is_to_be_promoted: false,
            is_pending_remove: false,
            is_deleted: false,
            last_down_time: None,
            last_up_time: Some(now),
            lsn: 0,
        }
    }

    pub fn is_in_configuration(&self) -> bool {
        matches!(self.cc_role, ReplicaRole::Primary | ReplicaRole::Secondary)
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        matches!(self.pc_role, ReplicaRole::Primary | ReplicaRole::Secondary)
    }

    pub fn is_stand_by(&self) -> bool {
        self.state == ReplicaState::StandBy
    }

    pub fn is_in_build(&self) -> bool {
        self.state == ReplicaState::InBuild
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    /// Up and fully built.
    pub fn is_available(&self) -> bool {
        self.is_up && self.is_ready()
    }

    /// Down, not dropped, and still inside its restart grace period.
    pub fn is_down_waiting(&self, now: SystemTime, wait: Duration) -> bool {
        if self.is_up || self.is_dropped() {
            return false;
        }
        match self.last_down_time {
            Some(t) => now.duration_since(t).map_or(true, |elapsed| elapsed < wait),
            None => true,
        }
    }

    /// Down for longer than the restart grace period.
    pub fn is_down_expired(&self, now: SystemTime, wait: Duration) -> bool {
        !self.is_up && !self.is_dropped() && !self.is_down_waiting(now, wait)
    }

    /// Marks the replica down at `now`.
    pub fn mark_down(&mut self, now: SystemTime) {
        if self.is_up {
            self.is_up = false;
            self.last_down_time = Some(now);
        }
    }

    /// Marks the replica up at `now` on the given node instance.
    pub fn mark_up(&mut self, node: NodeInstance, now: SystemTime) {
        self.node = node;
        if !self.is_up {
            self.is_up = true;
            self.last_up_time = Some(now);
            self.instance_id += 1;
        }
    }

    /// Marks the replica dropped: it will never come back with its data.
    pub fn mark_dropped(&mut self) {
        self.state = ReplicaState::Dropped;
        self.is_up = false;
        self.cc_role = ReplicaRole::None;
        self.is_to_be_dropped = false;
        self.is_to_be_promoted = false;
        self.is_primary_to_be_swapped_out = false;
    }

    fn flags_abbrev(&self) -> String {
        let mut flags = String::new();
        if self.is_to_be_dropped {
            flags.push('R');
        }
        if self.is_primary_to_be_swapped_out {
            flags.push('S');
        }
        if self.is_to_be_promoted {
            flags.push('P');
        }
        if self.is_pending_remove {
            flags.push('N');
        }
        if self.is_deleted {
            flags.push('D');
        }
        if flags.is_empty() {
            flags.push('-');
        }
        flags
    }
}

impl fmt::Display for ReplicaDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{} {}/{} {} {} {}]",
            self.node.id,
            self.pc_role.abbrev(),
            self.cc_role.abbrev(),
            self.state.abbrev(),
            self.flags_abbrev(),
            if self.is_up { "Up" } else { "Down" }
        )
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;

    #[test]
    fn down_waiting_window() {
        let now = SystemTime::now();
        let mut r = ReplicaDescription::new_in_build(
            NodeInstance::new(1, 1),
            1,
            ReplicaRole::Secondary,
            now,
        );
        r.state = ReplicaState::Ready;
        assert!(!r.is_down_waiting(now, Duration::from_secs(5)));
        r.mark_down(now);
        assert!(r.is_down_waiting(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(r.is_down_expired(now + Duration::from_secs(6), Duration::from_secs(5)));
        r.mark_dropped();
        assert!(!r.is_down_waiting(now, Duration::from_secs(5)));
        assert!(!r.is_down_expired(now + Duration::from_secs(6), Duration::from_secs(5)));
    }

    #[test]
    fn display_compact() {
        let mut r = ReplicaDescription::new_in_build(
            NodeInstance::new(4, 1),
            1,
            ReplicaRole::Primary,
            SystemTime::now(),
        );
        r.is_to_be_dropped = true;
        assert_eq!(format!("{}", r), "[4 N/P IB R Up]");
    }

    #[test]
    fn reopen_bumps_instance() {
        let now = SystemTime::now();
        let mut r = ReplicaDescription::new_in_build(
            NodeInstance::new(2, 1),
            9,
            ReplicaRole::Idle,
            now,
        );
        r.mark_down(now);
        r.mark_up(NodeInstance::new(2, 2), now);
        assert_eq!(r.instance_id, 2);
        assert_eq!(r.node.instance, 2);
    }
}
