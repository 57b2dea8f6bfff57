//! Replica count computation (the placement task) and node selection for
//! new replicas.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::failover::{NodeId, NodeInstance, ReplicaDescription, ReplicaRole};
use crate::manager::{FailoverUnit, NodeInfo};
use crate::utils::FailoverError;

use tokio::time::Duration;

/// Replica counts the replica difference is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementCounts {
    /// Desired replica set size.
    pub target: i32,

    /// Up, ready replicas that count towards the target.
    pub existing: i32,

    /// Up replicas still being built.
    pub in_build: i32,

    /// Built replicas waiting to be promoted into the configuration.
    pub moving: i32,

    /// Down replicas still within their restart wait.
    pub down_waiting: i32,
}

/// Number of replicas to add (positive) or drop (negative).
pub fn compute_replica_difference(counts: PlacementCounts) -> i32 {
    let needed =
        (counts.target - counts.existing - counts.in_build.max(counts.moving)).max(0);
    if needed > 0 {
        return (needed - counts.down_waiting).max(0);
    }

    let surplus = counts.existing + counts.moving - counts.target;
    if surplus > 0 {
        -surplus
    } else {
        0
    }
}

/// Inputs of the placement task that do not live in the failover unit.
#[derive(Debug, Clone, Copy)]
pub struct PlacementContext {
    pub now: SystemTime,

    /// Cluster default; the service may override it.
    pub replica_restart_wait: Duration,

    /// No node went down recently.
    pub is_node_cache_stable: bool,

    pub allow_singleton_move: bool,
}

fn counts_towards_target(r: &ReplicaDescription) -> bool {
    r.is_available()
        && !r.is_to_be_dropped
        && !r.is_to_be_promoted
        && r.cc_role != ReplicaRole::None
}

/// Computes and stores `fu.replica_difference`. Returns the new value.
pub fn run_placement_task(fu: &mut FailoverUnit, ctx: &PlacementContext) -> i32 {
    let difference = placement_difference(fu, ctx);
    fu.replica_difference = difference;
    difference
}

fn placement_difference(fu: &FailoverUnit, ctx: &PlacementContext) -> i32 {
    if fu.is_changing_configuration() || fu.is_to_be_deleted {
        return 0;
    }

    let wait = fu.service.replica_restart_wait_duration(ctx.replica_restart_wait);
    let down_waiting = fu
        .replicas
        .iter()
        .filter(|r| r.is_down_waiting(ctx.now, wait))
        .count() as i32;
    let in_build = fu
        .replicas
        .iter()
        .filter(|r| r.is_up && r.is_in_build() && !r.is_to_be_dropped)
        .count() as i32;
    let target = fu.target() as i32;

    if fu.is_configuration_empty() {
        let has_replicas = fu.replicas.iter().any(|r| !r.is_dropped());
        if !has_replicas && !ctx.is_node_cache_stable {
            return 0;
        }
        if down_waiting > 0 {
            return 0;
        }
        return compute_replica_difference(PlacementCounts {
            target,
            existing: 0,
            in_build,
            moving: 0,
            down_waiting: 0,
        });
    }

    let primary = match fu.primary() {
        Some(p) if p.is_up && !p.is_dropped() => p,
        _ => return 0,
    };

    // wait for members to come back rather than building around them
    let min = fu.description.min_replica_set_size as usize;
    if fu.available_count() < min && down_waiting > 0 {
        return 0;
    }

    let mut target = target;
    if target == 1 && primary.is_primary_to_be_swapped_out && ctx.allow_singleton_move {
        target += 1;
    }

    let existing = fu.replicas.iter().filter(|r| counts_towards_target(r)).count() as i32;
    let moving = fu
        .replicas
        .iter()
        .filter(|r| r.is_available() && r.is_to_be_promoted && !r.is_to_be_dropped)
        .count() as i32;

    compute_replica_difference(PlacementCounts {
        target,
        existing,
        in_build,
        moving,
        down_waiting,
    })
}

/// Picks up to `count` placeable nodes not hosting a replica of `fu`,
/// least loaded first. Chosen nodes get their load bumped.
pub fn select_nodes(
    fu: &FailoverUnit,
    nodes: &HashMap<NodeId, NodeInfo>,
    load: &mut HashMap<NodeId, usize>,
    count: usize,
) -> Vec<NodeInstance> {
    let mut candidates: Vec<(usize, NodeId, NodeInstance)> = nodes
        .values()
        .filter(|n| n.is_placeable() && !fu.hosts_replica_on(n.node.id))
        .map(|n| (load.get(&n.node.id).copied().unwrap_or(0), n.node.id, n.node))
        .collect();
    candidates.sort();

    let chosen: Vec<NodeInstance> = candidates
        .into_iter()
        .take(count)
        .map(|(_, _, node)| node)
        .collect();
    for node in &chosen {
        *load.entry(node.id).or_insert(0) += 1;
    }
    chosen
}

/// Acts on `fu.replica_difference`: adds InBuild replicas on chosen nodes
/// or marks surplus replicas ToBeDropped. An empty configuration only ever
/// gets its primary placed. Returns the number of replicas touched.
pub fn apply_replica_difference(
    fu: &mut FailoverUnit,
    nodes: &HashMap<NodeId, NodeInfo>,
    load: &mut HashMap<NodeId, usize>,
    now: SystemTime,
) -> Result<usize, FailoverError> {
    let difference = fu.replica_difference;
    if difference == 0 {
        return Ok(0);
    }

    if difference < 0 {
        return Ok(drop_surplus(fu, nodes, (-difference) as usize));
    }

    let (role, count) = if fu.is_configuration_empty() {
        let primary_in_build = fu
            .replicas
            .iter()
            .any(|r| r.cc_role == ReplicaRole::Primary && !r.is_dropped());
        if primary_in_build {
            return Ok(0);
        }
        (ReplicaRole::Primary, 1)
    } else {
        (ReplicaRole::Idle, difference as usize)
    };

    let chosen = select_nodes(fu, nodes, load, count);
    if chosen.is_empty() {
        return Err(FailoverError::InsufficientResources(format!(
            "no node available for {} of {}",
            count,
            fu.id()
        )));
    }
    for node in &chosen {
        fu.add_replica(*node, role, now);
    }
    Ok(chosen.len())
}

// idles go before secondaries, and replicas on deactivated nodes first
fn drop_surplus(fu: &mut FailoverUnit, nodes: &HashMap<NodeId, NodeInfo>, surplus: usize) -> usize {
    let mut victims: Vec<(bool, bool, usize)> = fu
        .replicas
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            !r.is_dropped() && !r.is_to_be_dropped && r.cc_role != ReplicaRole::Primary
        })
        .map(|(i, r)| {
            let activated = nodes.get(&r.node.id).map_or(false, |n| n.is_activated);
            (activated, r.cc_role == ReplicaRole::Secondary, i)
        })
        .collect();
    victims.sort();

    let mut dropped = 0;
    for (_, _, i) in victims.into_iter().take(surplus) {
        fu.replicas[i].is_to_be_dropped = true;
        fu.replicas[i].is_to_be_promoted = false;
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod placement_tests {
    use super::*;
    use crate::failover::{FailoverUnitId, ReplicaState, ServiceDescription};

    fn counts(
        target: i32,
        existing: i32,
        in_build: i32,
        moving: i32,
        down_waiting: i32,
    ) -> PlacementCounts {
        PlacementCounts {
            target,
            existing,
            in_build,
            moving,
            down_waiting,
        }
    }

    #[test]
    fn difference_arithmetic() {
        assert_eq!(compute_replica_difference(counts(3, 1, 1, 0, 0)), 1);
        assert_eq!(compute_replica_difference(counts(3, 1, 1, 0, 1)), 0);
        assert_eq!(compute_replica_difference(counts(3, 0, 0, 0, 0)), 3);
        assert_eq!(compute_replica_difference(counts(3, 1, 1, 2, 0)), 0);
        assert_eq!(compute_replica_difference(counts(1, 2, 0, 0, 0)), -1);
        assert_eq!(compute_replica_difference(counts(3, 3, 1, 0, 0)), 0);
    }

    fn ctx(stable: bool) -> PlacementContext {
        PlacementContext {
            now: SystemTime::now(),
            replica_restart_wait: Duration::from_secs(60),
            is_node_cache_stable: stable,
            allow_singleton_move: true,
        }
    }

    fn nodes(n: u64) -> HashMap<NodeId, NodeInfo> {
        (1..=n)
            .map(|id| (id, NodeInfo::new(NodeInstance::new(id, 1))))
            .collect()
    }

    fn ready_unit(target: u32, secondaries: u64) -> FailoverUnit {
        let now = SystemTime::now();
        let mut fu = FailoverUnit::new(
            FailoverUnitId::new(),
            ServiceDescription::new_stateful("svc", 1, target, 1),
        );
        fu.add_replica(NodeInstance::new(1, 1), ReplicaRole::Primary, now);
        for node in 0..secondaries {
            fu.add_replica(NodeInstance::new(node + 2, 1), ReplicaRole::Secondary, now);
        }
        for r in fu.replicas.iter_mut() {
            r.state = ReplicaState::Ready;
        }
        fu
    }

    #[test]
    fn empty_configuration_waits_for_stable_nodes() {
        let mut fu = FailoverUnit::new(
            FailoverUnitId::new(),
            ServiceDescription::new_stateful("svc", 1, 3, 2),
        );
        assert_eq!(run_placement_task(&mut fu, &ctx(false)), 0);
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 3);

        let mut load = HashMap::new();
        let placed =
            apply_replica_difference(&mut fu, &nodes(3), &mut load, SystemTime::now());
        assert_eq!(placed.ok(), Some(1));
        assert_eq!(fu.replicas[0].cc_role, ReplicaRole::Primary);
        assert!(fu.replicas[0].is_in_build());

        // primary still building: nothing more is placed
        let placed =
            apply_replica_difference(&mut fu, &nodes(3), &mut load, SystemTime::now());
        assert_eq!(placed.ok(), Some(0));
    }

    #[test]
    fn builds_missing_secondaries() {
        let mut fu = ready_unit(3, 1);
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 1);
        let mut load = HashMap::new();
        let placed =
            apply_replica_difference(&mut fu, &nodes(4), &mut load, SystemTime::now());
        assert_eq!(placed.ok(), Some(1));
        let added = &fu.replicas[2];
        assert_eq!(added.cc_role, ReplicaRole::Idle);
        assert!(!matches!(added.node.id, 1 | 2));
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 0);
    }

    #[test]
    fn down_secondary_within_wait_not_replaced() {
        let mut fu = ready_unit(3, 2);
        fu.replicas[2].mark_down(SystemTime::now());
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 0);
    }

    #[test]
    fn down_primary_blocks_placement() {
        let mut fu = ready_unit(3, 1);
        fu.replicas[0].mark_down(SystemTime::now());
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 0);
    }

    #[test]
    fn singleton_move_adds_one() {
        let mut fu = ready_unit(1, 0);
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 0);
        fu.replicas[0].is_primary_to_be_swapped_out = true;
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), 1);
        let mut no_move = ctx(true);
        no_move.allow_singleton_move = false;
        assert_eq!(run_placement_task(&mut fu, &no_move), 0);
    }

    #[test]
    fn surplus_drops_deactivated_first() {
        let mut fu = ready_unit(2, 2);
        assert_eq!(run_placement_task(&mut fu, &ctx(true)), -1);
        let mut cluster = nodes(3);
        if let Some(n) = cluster.get_mut(&3) {
            n.is_activated = false;
        }
        let mut load = HashMap::new();
        let dropped =
            apply_replica_difference(&mut fu, &cluster, &mut load, SystemTime::now());
        assert_eq!(dropped.ok(), Some(1));
        assert!(fu.replicas[2].is_to_be_dropped);
        assert!(!fu.replicas[1].is_to_be_dropped);
    }

    #[test]
    fn no_candidates_is_insufficient_resources() {
        let mut fu = ready_unit(3, 1);
        run_placement_task(&mut fu, &ctx(true));
        let mut load = HashMap::new();
        let res = apply_replica_difference(&mut fu, &nodes(2), &mut load, SystemTime::now());
        assert!(matches!(res, Err(FailoverError::InsufficientResources(_))));
    }
}
