//! Agent -- local replica lifecycle: open, close, delete, host replies,
//! retries, and tombstone cleanup.

use super::*;

use crate::failover::{ReplicaRole, ReplicaState, ServiceDescription};
use crate::health::HealthState;
use crate::messaging::{ReplicaMessageBody, ReplicaReplyBody};

// ReconfigurationAgent replica lifecycle related logic
impl ReconfigurationAgent {
    fn health_entity(&self, fu: &LocalFailoverUnit) -> String {
        format!("replica/{}/{}", fu.id(), self.node.id)
    }

    // sends a reply to the failover manager owning `fu`
    fn reply_to_owner(&self, fu: &LocalFailoverUnit, body: MessageBody, actions: &mut ActionQueue) {
        actions.send_message(
            Endpoint::Manager(fu.owner()),
            Message::new(self.me, body),
        );
    }

    fn build_reply(fu: &LocalFailoverUnit, error: Option<String>) -> MessageBody {
        let body = ReplicaReplyBody {
            fu: fu.description.clone(),
            replica: if error.is_some() {
                fu.dropped_replica()
            } else {
                fu.reply_replica()
            },
            error,
        };
        if fu.local_replica.cc_role == ReplicaRole::Primary {
            MessageBody::AddPrimaryReply(body)
        } else {
            MessageBody::AddReplicaReply(body)
        }
    }

    /// Hands a request about the local replica to the host. A synchronous
    /// host completes it before this returns.
    pub(super) fn dispatch(
        &self,
        fu: &mut LocalFailoverUnit,
        kind: HostRequestKind,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        let request = HostRequest {
            failover_unit_id: fu.id(),
            replica_id: fu.local_replica.replica_id,
            kind,
        };
        if self.host.is_synchronous() {
            let lsn = fu.local_replica.lsn;
            self.on_host_completed(fu, &request, Ok(lsn), ctx, actions);
        } else if self.deactivation.is_ready(fu.owner()) {
            actions.push(StateMachineAction::Host(request));
        }
    }

    /// AddPrimary or AddReplica from the failover manager.
    pub(super) fn process_add_replica(
        &self,
        slot: &mut Slot,
        msg: &Message,
        body: &ReplicaMessageBody,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let id = body.fu.failover_unit_id;
        let is_primary = matches!(msg.body, MessageBody::AddPrimary(_));

        if let Some(fu) = slot.as_mut() {
            let same_replica = fu.local_replica.replica_id == body.replica.replica_id;
            if same_replica && !fu.is_deleted && fu.open_pending.is_set() {
                pf_trace!(self.me; "{} open already in progress", id);
                return Ok(());
            }
            if same_replica && !fu.is_deleted && fu.is_open() {
                self.update_service_description(fu, &body.service, ctx, actions);
                self.reply_to_owner(fu, Self::build_reply(fu, None), actions);
                return Ok(());
            }
            if !fu.is_deleted && fu.local_replica.replica_id > body.replica.replica_id {
                pf_debug!(self.me; "{} ignoring build of older replica {}",
                                   id, body.replica.replica_id);
                return Ok(());
            }
        }

        let mut replica = body.replica.clone();
        replica.node = self.node;
        replica.state = ReplicaState::InBuild;
        replica.is_up = true;
        replica.cc_role = if is_primary {
            ReplicaRole::Primary
        } else {
            ReplicaRole::Idle
        };
        replica.last_up_time = Some(ctx.now);
        let mut fu = LocalFailoverUnit::new(body.fu.clone(), body.service.clone(), replica);

        // memberships of a replaced unit carry over so set changes stay paired
        if let Some(old) = slot.take() {
            fu.open_pending = old.open_pending;
            fu.close_pending = old.close_pending;
            fu.message_retry = old.message_retry;
            fu.cleanup_pending = old.cleanup_pending;
            fu.service_update_pending = old.service_update_pending;
            fu.open_failures = old.open_failures;
        }
        fu.close_pending.set_value(id, false, actions);
        fu.message_retry.set_value(id, false, actions);
        fu.cleanup_pending.set_value(id, false, actions);
        fu.service_update_pending.set_value(id, false, actions);

        if !self.deactivation.is_activated(fu.owner()) {
            pf_info!(self.me; "{} rejecting build on deactivated node", id);
            fu.open_pending.set_value(id, false, actions);
            self.reply_to_owner(
                &fu,
                Self::build_reply(&fu, Some("node is deactivated".into())),
                actions,
            );
            self.tombstone(&mut fu, ctx, actions);
            *slot = Some(fu);
            return Ok(());
        }

        pf_info!(self.me; "opening {} as {}", id, fu.local_replica);
        fu.open_pending.set_value(id, true, actions);
        self.dispatch(&mut fu, HostRequestKind::Open, ctx, actions);
        *slot = Some(fu);
        Ok(())
    }

    /// DeleteReplica from the failover manager.
    pub(super) fn process_delete_replica(
        &self,
        slot: &mut Slot,
        body: &ReplicaMessageBody,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu)
                if !fu.is_deleted
                    && fu.local_replica.replica_id == body.replica.replica_id =>
            {
                fu
            }
            _ => {
                // nothing of that replica left here
                let reply = ReplicaReplyBody {
                    fu: body.fu.clone(),
                    replica: body.replica.clone(),
                    error: None,
                };
                actions.send_message(
                    Endpoint::Manager(body.fu.failover_unit_id.owner()),
                    Message::new(self.me, MessageBody::DeleteReplicaReply(reply)),
                );
                return Ok(());
            }
        };

        // a delete that keeps failing escalates to obliterate
        let stuck = fu.close_failures.state(
            ctx.config.continuous_failure_warning_threshold,
            ctx.config.continuous_failure_error_threshold,
        ) == HealthState::Error;
        let mode = if stuck {
            ReplicaCloseMode::Obliterate
        } else {
            ReplicaCloseMode::Delete
        };
        if fu.close_pending.is_set() && fu.close_mode == Some(mode) {
            return Ok(());
        }
        let owner = Endpoint::Manager(fu.owner());
        self.close_local_replica(fu, mode, Some(owner), ctx, actions);
        Ok(())
    }

    /// Closes the local replica; what follows the close depends on `mode`.
    pub(super) fn close_local_replica(
        &self,
        fu: &mut LocalFailoverUnit,
        mode: ReplicaCloseMode,
        sender: Option<Endpoint>,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        let id = fu.id();
        fu.close_mode = Some(mode);
        fu.sender = sender;
        let was_opening = fu.open_pending.is_set();
        fu.open_pending.set_value(id, false, actions);
        fu.open_mode = None;
        if fu.is_reconfiguring() {
            pf_info!(self.me; "{} abandoning reconfiguration at {}",
                              id, fu.reconfiguration_stage);
            self.abandon_reconfiguration(fu, actions);
        }

        // a reopen in flight may still bring the replica up on the host
        if fu.is_closed && !was_opening {
            self.after_close(fu, ctx, actions);
            return;
        }
        pf_info!(self.me; "closing {} mode {}", id, mode);
        fu.close_pending.set_value(id, true, actions);
        self.dispatch(fu, HostRequestKind::Close(mode), ctx, actions);
    }

    /// Reopens a replica that was closed without being dropped.
    pub(super) fn reopen_down_replica(
        &self,
        fu: &mut LocalFailoverUnit,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        if fu.is_deleted || !self.deactivation.is_activated(fu.owner()) {
            return;
        }
        pf_info!(self.me; "reopening {}", fu.id());
        fu.open_mode = Some(ReplicaOpenMode::Reopen);
        fu.open_pending.set_value(fu.id(), true, actions);
        self.dispatch(fu, HostRequestKind::Open, ctx, actions);
    }

    /// Result of a host request made from an earlier transition.
    pub(super) fn on_host_reply(
        &self,
        slot: &mut Slot,
        request: &HostRequest,
        result: Result<i64, FailoverError>,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        match slot.as_mut() {
            Some(fu) if fu.local_replica.replica_id == request.replica_id => {
                self.on_host_completed(fu, request, result, ctx, actions);
            }
            _ => {
                pf_debug!(self.me; "stale host reply for {}", request);
            }
        }
        Ok(())
    }

    fn on_host_completed(
        &self,
        fu: &mut LocalFailoverUnit,
        request: &HostRequest,
        result: Result<i64, FailoverError>,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        match request.kind {
            HostRequestKind::Open if fu.open_pending.is_set() => {
                self.finish_open(fu, result, ctx, actions)
            }
            HostRequestKind::Close(mode)
                if fu.close_pending.is_set() && fu.close_mode == Some(mode) =>
            {
                self.finish_close(fu, mode, result, ctx, actions)
            }
            HostRequestKind::UpdateServiceDescription if fu.service_update_pending.is_set() => {
                match result {
                    Ok(_) => fu.service_update_pending.set_value(fu.id(), false, actions),
                    Err(e) => {
                        pf_debug!(self.me; "{} service update failed: {}", fu.id(), e);
                    }
                }
            }
            _ => {
                pf_trace!(self.me; "ignoring completed {}", request);
            }
        }
    }

    fn finish_open(
        &self,
        fu: &mut LocalFailoverUnit,
        result: Result<i64, FailoverError>,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        let id = fu.id();
        let entity = self.health_entity(fu);
        match result {
            Ok(lsn) => {
                fu.open_pending.set_value(id, false, actions);
                fu.is_closed = false;
                fu.close_mode = None;
                fu.local_replica.state = ReplicaState::Ready;
                fu.local_replica.is_up = true;
                fu.local_replica.lsn = lsn;
                fu.local_replica.last_up_time = Some(ctx.now);
                if fu.open_failures.on_success() {
                    actions.report_health(entity, HealthState::Ok, "replica opened");
                }
                pf_info!(self.me; "opened {}", fu);
                if fu.open_mode == Some(ReplicaOpenMode::New) {
                    self.reply_to_owner(fu, Self::build_reply(fu, None), actions);
                }
                fu.open_mode = None;
            }

            Err(e) => {
                let state = fu.open_failures.on_failure(
                    ctx.config.continuous_failure_warning_threshold,
                    ctx.config.continuous_failure_error_threshold,
                );
                actions.report_health(
                    entity,
                    state,
                    format!("open failed {} times: {}", fu.open_failures.count(), e),
                );
                if fu.open_mode == Some(ReplicaOpenMode::New) {
                    pf_warn!(self.me; "{} open failed: {}", id, e);
                    fu.open_pending.set_value(id, false, actions);
                    fu.open_mode = None;
                    self.reply_to_owner(fu, Self::build_reply(fu, Some(e.to_string())), actions);
                    self.tombstone(fu, ctx, actions);
                }
                // a reopen stays pending and is retried
            }
        }
    }

    fn finish_close(
        &self,
        fu: &mut LocalFailoverUnit,
        mode: ReplicaCloseMode,
        result: Result<i64, FailoverError>,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        let id = fu.id();
        let entity = self.health_entity(fu);
        let lsn = match result {
            Ok(lsn) => Some(lsn),
            Err(e) if mode != ReplicaCloseMode::Obliterate => {
                let state = fu.close_failures.on_failure(
                    ctx.config.continuous_failure_warning_threshold,
                    ctx.config.continuous_failure_error_threshold,
                );
                actions.report_health(
                    entity,
                    state,
                    format!("close failed {} times: {}", fu.close_failures.count(), e),
                );
                return;
            }
            Err(_) => None,
        };

        if fu.close_failures.on_success() {
            actions.report_health(entity, HealthState::Ok, "replica closed");
        }
        fu.close_pending.set_value(id, false, actions);
        fu.is_closed = true;
        fu.local_replica.is_up = false;
        if let Some(lsn) = lsn {
            fu.local_replica.lsn = lsn;
        }
        if mode.is_drop() {
            fu.local_replica.state = ReplicaState::Dropped;
        }
        if fu.reconfiguration_stage == ReconfigurationStage::Phase0Demote {
            fu.reconfiguration_stage = ReconfigurationStage::None;
        }
        pf_info!(self.me; "closed {} mode {}", id, mode);
        self.after_close(fu, ctx, actions);
    }

    // follow-up of a completed close
    fn after_close(
        &self,
        fu: &mut LocalFailoverUnit,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        let mode = match fu.close_mode {
            Some(mode) => mode,
            None => return,
        };
        match mode {
            ReplicaCloseMode::Close => {}

            ReplicaCloseMode::Restart | ReplicaCloseMode::DeactivateNode => {
                self.reopen_down_replica(fu, ctx, actions);
            }

            ReplicaCloseMode::Deactivate => {
                if let Some(to) = fu.sender.take() {
                    let body = ReplicaReplyBody {
                        fu: fu.description.clone(),
                        replica: fu.dropped_replica(),
                        error: None,
                    };
                    actions.send_message(to, Message::new(self.me, MessageBody::DeactivateReply(body)));
                }
            }

            ReplicaCloseMode::Delete | ReplicaCloseMode::Obliterate => {
                fu.sender = None;
                let body = ReplicaReplyBody {
                    fu: fu.description.clone(),
                    replica: fu.dropped_replica(),
                    error: None,
                };
                self.reply_to_owner(fu, MessageBody::DeleteReplicaReply(body), actions);
                self.tombstone(fu, ctx, actions);
            }
        }
    }

    // keeps a deleted unit around until the tombstone expires
    fn tombstone(&self, fu: &mut LocalFailoverUnit, ctx: &AgentContext, actions: &mut ActionQueue) {
        fu.is_closed = true;
        fu.is_deleted = true;
        fu.deleted_time = Some(ctx.now);
        fu.local_replica = fu.dropped_replica();
        fu.cleanup_pending.set_value(fu.id(), true, actions);
    }

    /// Applies a newer service description; an open replica is told about
    /// it through the host.
    pub(super) fn update_service_description(
        &self,
        fu: &mut LocalFailoverUnit,
        service: &ServiceDescription,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) {
        if service.update_version <= fu.service.update_version {
            return;
        }
        pf_debug!(self.me; "{} service {} updated to v{}",
                           fu.id(), service.name, service.update_version);
        fu.service = service.clone();
        if fu.is_open() && !fu.open_pending.is_set() {
            fu.service_update_pending.set_value(fu.id(), true, actions);
            self.dispatch(fu, HostRequestKind::UpdateServiceDescription, ctx, actions);
        }
    }

    /// Restarts a replica found open in storage after the node came back.
    pub(super) fn recover_replica(
        &self,
        slot: &mut Slot,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        if let Some(fu) = slot.as_mut() {
            if fu.is_closed || fu.is_deleted {
                return Ok(());
            }
            let id = fu.id();
            if fu.is_reconfiguring() {
                self.abandon_reconfiguration(fu, actions);
            }
            fu.close_pending.set_value(id, false, actions);
            fu.is_closed = true;
            fu.close_mode = Some(ReplicaCloseMode::Restart);
            fu.local_replica.is_up = false;
            if fu.open_mode == Some(ReplicaOpenMode::New) {
                // the FM never got a reply; it rebuilds the replica
                fu.open_pending.set_value(id, false, actions);
                fu.open_mode = None;
                self.tombstone(fu, ctx, actions);
                return Ok(());
            }
            self.reopen_down_replica(fu, ctx, actions);
        }
        Ok(())
    }

    pub(super) fn retry_open(
        &self,
        slot: &mut Slot,
        _ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.open_pending.is_set() => fu,
            _ => return Ok(()),
        };
        if !self.deactivation.is_ready(fu.owner()) {
            return Ok(());
        }
        if fu.open_mode == Some(ReplicaOpenMode::Reopen)
            && !self.deactivation.is_activated(fu.owner())
        {
            pf_debug!(self.me; "{} reopen cancelled on deactivated node", fu.id());
            fu.open_pending.set_value(fu.id(), false, actions);
            fu.open_mode = None;
            fu.close_mode = Some(ReplicaCloseMode::DeactivateNode);
            return Ok(());
        }
        actions.push(StateMachineAction::Host(HostRequest {
            failover_unit_id: fu.id(),
            replica_id: fu.local_replica.replica_id,
            kind: HostRequestKind::Open,
        }));
        Ok(())
    }

    pub(super) fn retry_close(
        &self,
        slot: &mut Slot,
        _ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.close_pending.is_set() => fu,
            _ => return Ok(()),
        };
        if !self.deactivation.is_ready(fu.owner()) {
            return Ok(());
        }
        match fu.close_mode {
            Some(mode) => actions.push(StateMachineAction::Host(HostRequest {
                failover_unit_id: fu.id(),
                replica_id: fu.local_replica.replica_id,
                kind: HostRequestKind::Close(mode),
            })),
            None => fu.close_pending.set_value(fu.id(), false, actions),
        }
        Ok(())
    }

    pub(super) fn retry_service_update(
        &self,
        slot: &mut Slot,
        _ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.service_update_pending.is_set() => fu,
            _ => return Ok(()),
        };
        if !self.deactivation.is_ready(fu.owner()) {
            return Ok(());
        }
        if !fu.is_open() {
            fu.service_update_pending.set_value(fu.id(), false, actions);
            return Ok(());
        }
        actions.push(StateMachineAction::Host(HostRequest {
            failover_unit_id: fu.id(),
            replica_id: fu.local_replica.replica_id,
            kind: HostRequestKind::UpdateServiceDescription,
        }));
        Ok(())
    }

    /// Erases deleted units whose tombstone has expired.
    pub(super) fn state_cleanup(
        &self,
        slot: &mut Slot,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.cleanup_pending.is_set() => fu,
            _ => return Ok(()),
        };
        let id = fu.id();
        if !fu.is_deleted || !fu.is_closed {
            fu.cleanup_pending.set_value(id, false, actions);
            return Ok(());
        }
        let expired = fu.deleted_time.map_or(true, |t| {
            ctx.now.duration_since(t).map_or(false, |elapsed| {
                elapsed >= ctx.config.deleted_failover_unit_tombstone_duration()
            })
        });
        if !expired {
            return Ok(());
        }

        // no memberships may outlive the unit
        for mut flag in fu.flags() {
            flag.set_value(id, false, actions);
        }
        pf_debug!(self.me; "erasing tombstone of {}", id);
        *slot = None;
        Ok(())
    }
}
