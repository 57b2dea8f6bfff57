//! State machine tasks run on a locked failover unit, and the handlers of
//! agent replies that edit it.
//!
//! Every function here is synchronous and only edits the unit and queues
//! actions; committing and executing the actions is up to the caller.

use std::time::SystemTime;

use crate::config::FailoverConfig;
use crate::failover::{write_quorum, Epoch, ReplicaRole, ReplicaState};
use crate::health::HealthState;
use crate::jobs::ActionQueue;
use crate::manager::FailoverUnit;
use crate::messaging::{
    ConfigurationMessageBody, ConfigurationReplyBody, Endpoint, Message,
    MessageBody, ReplicaMessageBody, ReplicaReplyBody,
};

/// Inputs shared by the tasks of one state machine pass.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub me: Endpoint,
    pub now: SystemTime,
    pub config: &'a FailoverConfig,
}

fn health_entity(fu: &FailoverUnit) -> String {
    format!("partition/{}", fu.id())
}

/// Drops replicas that stayed down past their restart wait and forgets
/// dropped replicas no configuration refers to.
pub fn state_update_task(fu: &mut FailoverUnit, ctx: &TaskContext) {
    let wait = fu
        .service
        .replica_restart_wait_duration(ctx.config.replica_restart_wait_duration());

    for r in fu.replicas.iter_mut() {
        let failed_build = !r.is_up && r.is_in_build();
        if r.is_down_expired(ctx.now, wait) || failed_build {
            if r.is_in_configuration() || r.is_in_previous_configuration() {
                // stays a member until a reconfiguration removes it
                r.state = ReplicaState::Dropped;
                r.is_up = false;
            } else {
                r.mark_dropped();
            }
        }
    }

    if !fu.is_changing_configuration() {
        fu.replicas.retain(|r| {
            !(r.is_dropped() && !r.is_in_configuration() && !r.is_in_previous_configuration())
        });
    }
}

fn reconfiguration_message(fu: &FailoverUnit) -> MessageBody {
    MessageBody::DoReconfiguration(ConfigurationMessageBody {
        fu: fu.description.clone(),
        replicas: fu.configuration_replicas(),
        service: fu.service.clone(),
    })
}

fn send_to_primary(fu: &FailoverUnit, ctx: &TaskContext, actions: &mut ActionQueue) {
    if let Some(primary) = fu.primary().filter(|p| p.is_up) {
        actions.send_message(
            Endpoint::Node(primary.node.id),
            Message::new(ctx.me, reconfiguration_message(fu)),
        );
    }
}

// puts CC back to PC; CC epoch is left as is so that the next attempt
// still moves forward
fn abort_reconfiguration(fu: &mut FailoverUnit) {
    for r in fu.replicas.iter_mut() {
        r.cc_role = r.pc_role;
        r.pc_role = ReplicaRole::None;
    }
    fu.description.pc_epoch = Epoch::invalid();
}

// returns false while quorum is lost and data loss is not yet declared
fn check_quorum(fu: &mut FailoverUnit, ctx: &TaskContext, actions: &mut ActionQueue) -> bool {
    let size = fu.members().count();
    let up = fu.members().filter(|r| r.is_up).count();
    if up >= write_quorum(size) {
        if fu.quorum_loss_time.take().is_some() {
            actions.report_health(health_entity(fu), HealthState::Ok, "quorum restored");
        }
        return true;
    }

    let since = match fu.quorum_loss_time {
        Some(t) => t,
        None => {
            pf_warn!(ctx.me; "{} lost quorum: {}/{} up", fu.id(), up, size);
            actions.report_health(
                health_entity(fu),
                HealthState::Error,
                format!("quorum lost: {}/{} replicas up", up, size),
            );
            fu.quorum_loss_time = Some(ctx.now);
            ctx.now
        }
    };
    let waited = ctx.now.duration_since(since).unwrap_or_default();
    if waited < ctx.config.recover_on_data_loss_wait_duration() {
        return false;
    }

    pf_warn!(ctx.me; "{} declaring data loss after {:?}", fu.id(), waited);
    for r in fu.replicas.iter_mut() {
        if r.is_in_configuration() && !r.is_up {
            r.mark_dropped();
        }
    }
    fu.description.cc_epoch = fu.description.cc_epoch.next_data_loss();
    fu.quorum_loss_time = None;
    actions.report_health(health_entity(fu), HealthState::Warning, "data loss declared");
    true
}

/// Starts a reconfiguration when the configuration no longer matches the
/// replicas: primary down or being swapped out, members to be dropped, or
/// ready idle replicas waiting to be promoted.
pub fn reconfiguration_task(
    fu: &mut FailoverUnit,
    ctx: &TaskContext,
    actions: &mut ActionQueue,
) {
    if fu.is_to_be_deleted {
        return;
    }
    if fu.is_changing_configuration() {
        let primary_lost = fu.primary().map_or(true, |p| p.is_dropped());
        if !primary_lost {
            return;
        }
        pf_info!(ctx.me; "{} new primary lost, restarting reconfiguration", fu.id());
        abort_reconfiguration(fu);
    }
    if fu.is_configuration_empty() {
        return;
    }
    if !check_quorum(fu, ctx, actions) || fu.is_configuration_empty() {
        return;
    }

    let current_primary = fu
        .replicas
        .iter()
        .position(|r| r.cc_role == ReplicaRole::Primary);
    if let Some(p) = current_primary {
        if fu.replicas[p].is_in_build() {
            return;
        }
    }

    let keep = current_primary.filter(|&i| {
        let p = &fu.replicas[i];
        p.is_up && !p.is_dropped() && !p.is_primary_to_be_swapped_out
    });
    let swapping =
        current_primary.map_or(false, |i| fu.replicas[i].is_primary_to_be_swapped_out);
    let new_primary = keep.or_else(|| {
        fu.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.is_available()
                    && !r.is_to_be_dropped
                    && !r.is_primary_to_be_swapped_out
                    && (r.cc_role == ReplicaRole::Secondary
                        || (swapping && r.cc_role == ReplicaRole::Idle))
            })
            .max_by_key(|(_, r)| (r.cc_role == ReplicaRole::Secondary, r.lsn))
            .map(|(i, _)| i)
    });
    let new_primary = match new_primary {
        Some(i) => i,
        None => {
            pf_debug!(ctx.me; "{} has no primary candidate", fu.id());
            return;
        }
    };

    let slots = (fu.target() as usize).saturating_sub(1);
    let mut secondaries: Vec<usize> = fu
        .replicas
        .iter()
        .enumerate()
        .filter(|(i, r)| {
            *i != new_primary
                && r.is_in_configuration()
                && !r.is_dropped()
                && !r.is_to_be_dropped
                && !r.is_primary_to_be_swapped_out
        })
        .map(|(i, _)| i)
        .collect();
    let mut promotable: Vec<usize> = fu
        .replicas
        .iter()
        .enumerate()
        .filter(|(i, r)| {
            *i != new_primary
                && r.cc_role == ReplicaRole::Idle
                && r.is_available()
                && !r.is_to_be_dropped
        })
        .map(|(i, _)| i)
        .collect();
    promotable.sort_by_key(|&i| !fu.replicas[i].is_to_be_promoted);
    let free = slots.saturating_sub(secondaries.len());
    secondaries.extend(promotable.into_iter().take(free));

    let new_roles: Vec<ReplicaRole> = fu
        .replicas
        .iter()
        .enumerate()
        .map(|(i, r)| {
            if i == new_primary {
                ReplicaRole::Primary
            } else if secondaries.contains(&i) {
                ReplicaRole::Secondary
            } else if r.is_in_configuration() {
                if r.is_dropped() {
                    ReplicaRole::None
                } else {
                    ReplicaRole::Idle
                }
            } else {
                r.cc_role
            }
        })
        .collect();
    let unchanged = fu
        .replicas
        .iter()
        .zip(new_roles.iter())
        .all(|(r, role)| r.cc_role == *role);
    if unchanged {
        return;
    }

    let primary_changed = current_primary != Some(new_primary);
    for (r, role) in fu.replicas.iter_mut().zip(new_roles) {
        let was_member = r.is_in_configuration();
        r.pc_role = r.cc_role;
        r.cc_role = role;
        if r.is_in_configuration() {
            r.is_to_be_promoted = false;
        } else if was_member && !r.is_dropped() {
            r.is_to_be_dropped = true;
            r.is_primary_to_be_swapped_out = false;
        }
    }
    let cc_epoch = fu.description.cc_epoch;
    fu.description.pc_epoch = cc_epoch;
    fu.description.cc_epoch = if primary_changed {
        cc_epoch.next_primary()
    } else {
        cc_epoch.next_configuration()
    };

    pf_info!(ctx.me; "reconfiguring {}", fu);
    send_to_primary(fu, ctx, actions);
}

/// Sends whatever the unit is waiting on: replica builds, deletes and an
/// unfinished reconfiguration. Runs on every scan, so each send doubles as
/// a retry. Returns true if the unit is deleted and can be erased.
pub fn pending_task(fu: &mut FailoverUnit, ctx: &TaskContext, actions: &mut ActionQueue) -> bool {
    if fu.is_changing_configuration() {
        send_to_primary(fu, ctx, actions);
    }

    let deleting = fu.is_to_be_deleted;
    let changing = fu.is_changing_configuration();
    for r in fu.replicas.iter() {
        if r.is_deleted || !r.is_up {
            continue;
        }
        let body = ReplicaMessageBody {
            fu: fu.description.clone(),
            replica: r.clone(),
            service: fu.service.clone(),
        };
        let leaving = r.is_to_be_dropped && !r.is_in_configuration() && !changing;
        let body = if deleting || leaving || r.is_pending_remove {
            MessageBody::DeleteReplica(body)
        } else if r.is_in_build() && r.cc_role == ReplicaRole::Primary {
            MessageBody::AddPrimary(body)
        } else if r.is_in_build() {
            MessageBody::AddReplica(body)
        } else {
            continue;
        };
        actions.send_message(Endpoint::Node(r.node.id), Message::new(ctx.me, body));
    }

    if deleting {
        fu.replicas.retain(|r| r.is_up && !r.is_deleted);
        return fu.replicas.is_empty();
    }
    false
}

/// Handles AddPrimaryReply and AddReplicaReply.
pub fn on_add_replica_reply(fu: &mut FailoverUnit, reply: &ReplicaReplyBody, ctx: &TaskContext) {
    let id = fu.id();
    let first_primary = fu.is_configuration_empty();
    let cc_epoch = fu.description.cc_epoch;
    let r = match fu.find_replica_mut(reply.replica.node.id, reply.replica.replica_id) {
        Some(r) if r.is_in_build() && r.is_up => r,
        _ => {
            pf_debug!(ctx.me; "{} ignoring stale build reply from {}", id, reply.replica.node);
            return;
        }
    };

    if let Some(e) = &reply.error {
        pf_info!(ctx.me; "{} build on {} failed: {}", id, r.node, e);
        r.mark_dropped();
        return;
    }

    r.state = ReplicaState::Ready;
    r.lsn = reply.replica.lsn;
    let role = r.cc_role;
    if role == ReplicaRole::Idle {
        r.is_to_be_promoted = true;
    }
    if role == ReplicaRole::Primary && (first_primary || !cc_epoch.is_valid()) {
        fu.description.cc_epoch = if cc_epoch.is_valid() {
            cc_epoch.next_primary()
        } else {
            Epoch::new(1, 1 << 32)
        };
    }
}

/// Handles DoReconfigurationReply; returns false if the reply is stale.
pub fn on_do_reconfiguration_reply(
    fu: &mut FailoverUnit,
    reply: &ConfigurationReplyBody,
    ctx: &TaskContext,
) -> bool {
    if !fu.is_changing_configuration() || reply.fu.cc_epoch != fu.description.cc_epoch {
        pf_debug!(ctx.me; "{} ignoring stale reconfiguration reply {}",
                          fu.id(), reply.fu.cc_epoch);
        return false;
    }
    if let Some(e) = &reply.error {
        pf_warn!(ctx.me; "{} reconfiguration failed: {}", fu.id(), e);
        return false;
    }

    for replied in &reply.replicas {
        if let Some(r) = fu.find_replica_mut(replied.node.id, replied.replica_id) {
            r.lsn = r.lsn.max(replied.lsn);
        }
    }
    for r in fu.replicas.iter_mut() {
        r.pc_role = ReplicaRole::None;
    }
    fu.description.pc_epoch = Epoch::invalid();
    pf_info!(ctx.me; "reconfiguration done {}", fu);
    true
}

/// Handles DeleteReplicaReply; returns true if the unit can be erased.
pub fn on_delete_replica_reply(
    fu: &mut FailoverUnit,
    reply: &ReplicaReplyBody,
    ctx: &TaskContext,
) -> bool {
    if reply.error.is_some() {
        return false;
    }
    if fu.remove_replica(reply.replica.node.id, reply.replica.replica_id) {
        pf_debug!(ctx.me; "{} replica on {} deleted", fu.id(), reply.replica.node);
    }
    fu.is_to_be_deleted && fu.replicas.is_empty()
}

#[cfg(test)]
mod tasks_tests {
    use super::*;
    use crate::failover::{
        FailoverManagerId, FailoverUnitId, NodeInstance, ServiceDescription,
    };
    use crate::jobs::StateMachineAction;
    use tokio::time::Duration;

    fn ctx(config: &FailoverConfig) -> TaskContext<'_> {
        TaskContext {
            me: Endpoint::Manager(FailoverManagerId::Fm),
            now: SystemTime::now(),
            config,
        }
    }

    fn sent(actions: &ActionQueue) -> Vec<(Endpoint, &'static str)> {
        actions
            .actions()
            .iter()
            .filter_map(|a| match a {
                StateMachineAction::SendMessage { to, message } => {
                    Some((*to, message.body.name()))
                }
                _ => None,
            })
            .collect()
    }

    // P on node 1, secondaries on 2.., all ready, configuration settled
    fn settled(target: u32, secondaries: u64) -> FailoverUnit {
        let now = SystemTime::now();
        let mut fu = FailoverUnit::new(
            FailoverUnitId::new(),
            ServiceDescription::new_stateful("svc", 1, target, 1),
        );
        fu.add_replica(NodeInstance::new(1, 1), ReplicaRole::Primary, now);
        for n in 0..secondaries {
            fu.add_replica(NodeInstance::new(n + 2, 1), ReplicaRole::Secondary, now);
        }
        for r in fu.replicas.iter_mut() {
            r.state = ReplicaState::Ready;
        }
        fu.description.cc_epoch = Epoch::new(1, 1 << 32);
        fu
    }

    fn reply_for(fu: &FailoverUnit, node: u64, error: Option<String>) -> ReplicaReplyBody {
        ReplicaReplyBody {
            fu: fu.description.clone(),
            replica: fu.replica_on(node).cloned().unwrap(),
            error,
        }
    }

    #[test]
    fn first_primary_ready_sets_epoch() {
        let config = FailoverConfig::default();
        let mut fu = FailoverUnit::new(
            FailoverUnitId::new(),
            ServiceDescription::new_stateful("svc", 1, 3, 2),
        );
        fu.add_replica(NodeInstance::new(4, 1), ReplicaRole::Primary, SystemTime::now());

        let mut actions = ActionQueue::new();
        pending_task(&mut fu, &ctx(&config), &mut actions);
        assert_eq!(sent(&actions), vec![(Endpoint::Node(4), "AddPrimary")]);

        let reply = reply_for(&fu, 4, None);
        on_add_replica_reply(&mut fu, &reply, &ctx(&config));
        assert!(fu.replicas[0].is_ready());
        assert_eq!(fu.description.cc_epoch, Epoch::new(1, 1 << 32));

        // duplicate reply is ignored
        on_add_replica_reply(&mut fu, &reply, &ctx(&config));
        assert_eq!(fu.description.cc_epoch, Epoch::new(1, 1 << 32));
    }

    #[test]
    fn failed_build_drops_replica() {
        let config = FailoverConfig::default();
        let mut fu = settled(3, 1);
        fu.add_replica(NodeInstance::new(5, 1), ReplicaRole::Idle, SystemTime::now());
        let reply = reply_for(&fu, 5, Some("open failed".into()));
        on_add_replica_reply(&mut fu, &reply, &ctx(&config));
        assert!(fu.replica_on(5).unwrap().is_dropped());
        state_update_task(&mut fu, &ctx(&config));
        assert!(fu.replica_on(5).is_none());
    }

    #[test]
    fn ready_idle_gets_promoted() {
        let config = FailoverConfig::default();
        let mut fu = settled(3, 1);
        fu.add_replica(NodeInstance::new(3, 1), ReplicaRole::Idle, SystemTime::now());
        let reply = reply_for(&fu, 3, None);
        on_add_replica_reply(&mut fu, &reply, &ctx(&config));
        assert!(fu.replica_on(3).unwrap().is_to_be_promoted);

        let mut actions = ActionQueue::new();
        reconfiguration_task(&mut fu, &ctx(&config), &mut actions);
        assert!(fu.is_changing_configuration());
        assert_eq!(fu.description.pc_epoch, Epoch::new(1, 1 << 32));
        assert_eq!(fu.description.cc_epoch, Epoch::new(1, (1 << 32) + 1));
        let promoted = fu.replica_on(3).unwrap();
        assert_eq!(promoted.pc_role, ReplicaRole::Idle);
        assert_eq!(promoted.cc_role, ReplicaRole::Secondary);
        assert_eq!(sent(&actions), vec![(Endpoint::Node(1), "DoReconfiguration")]);

        let reply = ConfigurationReplyBody {
            fu: fu.description.clone(),
            replicas: fu.configuration_replicas(),
            error: None,
        };
        assert!(on_do_reconfiguration_reply(&mut fu, &reply, &ctx(&config)));
        assert!(!fu.is_changing_configuration());
        assert!(!on_do_reconfiguration_reply(&mut fu, &reply, &ctx(&config)));
    }

    #[test]
    fn down_primary_fails_over() {
        let config = FailoverConfig::default();
        let mut fu = settled(3, 2);
        fu.replicas[2].lsn = 7;
        fu.replicas[0].mark_down(SystemTime::now());

        let mut actions = ActionQueue::new();
        reconfiguration_task(&mut fu, &ctx(&config), &mut actions);
        assert_eq!(fu.primary().map(|p| p.node.id), Some(3));
        assert_eq!(fu.description.cc_epoch, Epoch::new(1, 2 << 32));
        // the old primary stays a (down) secondary
        assert_eq!(fu.replica_on(1).unwrap().cc_role, ReplicaRole::Secondary);
        assert_eq!(sent(&actions), vec![(Endpoint::Node(3), "DoReconfiguration")]);
    }

    #[test]
    fn quorum_loss_then_data_loss() {
        let mut config = FailoverConfig::default();
        config.recover_on_data_loss_wait_duration_ms = 0;
        let mut fu = settled(3, 2);
        let now = SystemTime::now();
        fu.replicas[0].mark_down(now);
        fu.replicas[1].mark_down(now);

        let mut actions = ActionQueue::new();
        let mut c = ctx(&config);
        c.now = now;
        reconfiguration_task(&mut fu, &c, &mut actions);
        // data loss declared at once: the survivor becomes primary
        assert_eq!(fu.description.cc_epoch.data_loss_version, 2);
        assert_eq!(fu.primary().map(|p| p.node.id), Some(3));
        assert!(actions.actions().iter().any(|a| matches!(
            a,
            StateMachineAction::ReportHealth { state: HealthState::Error, .. }
        )));
    }

    #[test]
    fn quorum_loss_waits() {
        let mut config = FailoverConfig::default();
        config.recover_on_data_loss_wait_duration_ms = 60_000;
        let mut fu = settled(3, 2);
        fu.replicas[0].mark_down(SystemTime::now());
        fu.replicas[1].mark_down(SystemTime::now());
        let mut actions = ActionQueue::new();
        reconfiguration_task(&mut fu, &ctx(&config), &mut actions);
        assert!(fu.is_quorum_lost());
        assert!(!fu.is_changing_configuration());
    }

    #[test]
    fn expired_member_dropped_and_removed() {
        let mut config = FailoverConfig::default();
        config.replica_restart_wait_duration_ms = 10;
        let mut fu = settled(3, 2);
        fu.replicas[2].mark_down(SystemTime::now() - Duration::from_secs(1));
        state_update_task(&mut fu, &ctx(&config));
        assert!(fu.replicas[2].is_dropped());
        assert_eq!(fu.replicas[2].cc_role, ReplicaRole::Secondary);

        let mut actions = ActionQueue::new();
        reconfiguration_task(&mut fu, &ctx(&config), &mut actions);
        assert_eq!(fu.replicas[2].cc_role, ReplicaRole::None);
        let reply = ConfigurationReplyBody {
            fu: fu.description.clone(),
            replicas: vec![],
            error: None,
        };
        on_do_reconfiguration_reply(&mut fu, &reply, &ctx(&config));
        state_update_task(&mut fu, &ctx(&config));
        assert_eq!(fu.replicas.len(), 2);
    }

    #[test]
    fn deleted_unit_deletes_replicas() {
        let config = FailoverConfig::default();
        let mut fu = settled(2, 1);
        fu.is_to_be_deleted = true;
        let mut actions = ActionQueue::new();
        assert!(!pending_task(&mut fu, &ctx(&config), &mut actions));
        assert_eq!(
            sent(&actions),
            vec![
                (Endpoint::Node(1), "DeleteReplica"),
                (Endpoint::Node(2), "DeleteReplica")
            ]
        );
        let r1 = reply_for(&fu, 1, None);
        let r2 = reply_for(&fu, 2, None);
        assert!(!on_delete_replica_reply(&mut fu, &r1, &ctx(&config)));
        assert!(on_delete_replica_reply(&mut fu, &r2, &ctx(&config)));
    }
}
