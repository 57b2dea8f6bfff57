//! Agent -- reconfiguration driven by a local primary, and the secondary
//! side of its phases.

use super::*;

use crate::failover::ReplicaRole;
use crate::messaging::{
    ConfigurationMessageBody, ConfigurationReplyBody, ReplicaReplyBody,
};

// ReconfigurationAgent reconfiguration related logic
impl ReconfigurationAgent {
    /// DoReconfiguration from the failover manager, sent to the new primary.
    pub(super) fn process_do_reconfiguration(
        &self,
        slot: &mut Slot,
        body: &ConfigurationMessageBody,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let id = body.fu.failover_unit_id;
        let fu = match slot.as_mut() {
            Some(fu) if fu.is_open() && !fu.is_deleted && !fu.open_pending.is_set() => fu,
            _ => {
                pf_debug!(self.me; "{} not open for reconfiguration", id);
                let reply = ConfigurationReplyBody {
                    fu: body.fu.clone(),
                    replicas: body.replicas.clone(),
                    error: Some("replica not open".into()),
                };
                actions.send_message(
                    Endpoint::Manager(id.owner()),
                    Message::new(self.me, MessageBody::DoReconfigurationReply(reply)),
                );
                return Ok(());
            }
        };

        let epoch = body.fu.cc_epoch;
        if epoch < fu.description.cc_epoch {
            pf_debug!(self.me; "{} ignoring stale reconfiguration {}", id, epoch);
            return Ok(());
        }
        if epoch == fu.description.cc_epoch {
            if !fu.is_reconfiguring() {
                self.send_reconfiguration_reply(fu, actions);
            }
            return Ok(());
        }

        if fu.is_reconfiguring() {
            pf_info!(self.me; "{} superseding reconfiguration at {}",
                              id, fu.reconfiguration_stage);
            self.abandon_reconfiguration(fu, actions);
        }
        self.update_service_description(fu, &body.service, ctx, actions);
        fu.description = body.fu.clone();
        fu.replicas = body.replicas.clone();
        fu.local_replica.pc_role = fu.local_replica.cc_role;
        fu.local_replica.cc_role = ReplicaRole::Primary;
        fu.message_retry.set_value(id, true, actions);
        pf_info!(self.me; "{} reconfiguring to {}", id, epoch);

        let local = self.node.id;
        fu.reconfiguration_stage = ReconfigurationStage::Phase1GetLsn;
        fu.lsn_replied.clear();
        fu.awaiting = fu
            .previous_configuration()
            .filter(|r| r.node.id != local && r.is_up && !r.is_dropped())
            .map(|r| r.node.id)
            .collect();
        self.send_phase_messages(fu, actions);
        self.advance_reconfiguration(fu, actions);
        Ok(())
    }

    /// Moves through the phases whose replies are all in.
    fn advance_reconfiguration(&self, fu: &mut LocalFailoverUnit, actions: &mut ActionQueue) {
        let local = self.node.id;
        loop {
            match fu.reconfiguration_stage {
                ReconfigurationStage::Phase1GetLsn => {
                    if !fu.has_read_quorum() {
                        return;
                    }
                    fu.reconfiguration_stage = ReconfigurationStage::Phase2Catchup;
                    fu.awaiting.clear();
                }

                ReconfigurationStage::Phase2Catchup => {
                    // catch up to the most advanced replica that answered
                    let best = fu
                        .replicas
                        .iter()
                        .filter(|r| fu.lsn_replied.contains(&r.node.id))
                        .map(|r| r.lsn)
                        .max()
                        .unwrap_or(0);
                    fu.local_replica.lsn = fu.local_replica.lsn.max(best);

                    fu.reconfiguration_stage = ReconfigurationStage::Phase3Deactivate;
                    fu.awaiting = fu
                        .replicas
                        .iter()
                        .filter(|r| {
                            r.node.id != local
                                && r.is_in_previous_configuration()
                                && !r.is_in_configuration()
                                && r.is_up
                                && !r.is_dropped()
                        })
                        .map(|r| r.node.id)
                        .collect();
                    self.send_phase_messages(fu, actions);
                }

                ReconfigurationStage::Phase3Deactivate => {
                    if !fu.awaiting.is_empty() {
                        return;
                    }
                    fu.reconfiguration_stage = ReconfigurationStage::Phase4Activate;
                    fu.awaiting = fu
                        .replicas
                        .iter()
                        .filter(|r| {
                            r.node.id != local
                                && r.cc_role == ReplicaRole::Secondary
                                && r.is_up
                        })
                        .map(|r| r.node.id)
                        .collect();
                    self.send_phase_messages(fu, actions);
                }

                ReconfigurationStage::Phase4Activate => {
                    if fu.awaiting.is_empty() {
                        self.complete_reconfiguration(fu, actions);
                    }
                    return;
                }

                _ => return,
            }
        }
    }

    fn complete_reconfiguration(&self, fu: &mut LocalFailoverUnit, actions: &mut ActionQueue) {
        fu.reconfiguration_stage = ReconfigurationStage::None;
        fu.awaiting.clear();
        fu.lsn_replied.clear();
        fu.message_retry.set_value(fu.id(), false, actions);
        fu.local_replica.pc_role = ReplicaRole::None;
        pf_info!(self.me; "{} reconfiguration to {} done",
                          fu.id(), fu.description.cc_epoch);
        self.send_reconfiguration_reply(fu, actions);
    }

    fn send_reconfiguration_reply(&self, fu: &LocalFailoverUnit, actions: &mut ActionQueue) {
        let local = &fu.local_replica;
        let replicas = fu
            .replicas
            .iter()
            .map(|r| {
                let mut r = r.clone();
                if r.node.id == local.node.id {
                    r.lsn = local.lsn;
                }
                r
            })
            .collect();
        let reply = ConfigurationReplyBody {
            fu: fu.description.clone(),
            replicas,
            error: None,
        };
        actions.send_message(
            Endpoint::Manager(fu.owner()),
            Message::new(self.me, MessageBody::DoReconfigurationReply(reply)),
        );
    }

    /// Stops a reconfiguration driven here without replying.
    pub(super) fn abandon_reconfiguration(
        &self,
        fu: &mut LocalFailoverUnit,
        actions: &mut ActionQueue,
    ) {
        fu.reconfiguration_stage = ReconfigurationStage::None;
        fu.awaiting.clear();
        fu.lsn_replied.clear();
        fu.message_retry.set_value(fu.id(), false, actions);
    }

    // (re)sends the current phase's message to every node not yet answered
    fn send_phase_messages(&self, fu: &LocalFailoverUnit, actions: &mut ActionQueue) {
        for &node in &fu.awaiting {
            let body = ConfigurationMessageBody {
                fu: fu.description.clone(),
                replicas: fu.replicas.clone(),
                service: fu.service.clone(),
            };
            let body = match fu.reconfiguration_stage {
                ReconfigurationStage::Phase1GetLsn => MessageBody::GetLSN(body),
                ReconfigurationStage::Phase3Deactivate => MessageBody::Deactivate(body),
                ReconfigurationStage::Phase4Activate => MessageBody::Activate(body),
                _ => return,
            };
            actions.send_message(Endpoint::Node(node), Message::new(self.me, body));
        }
    }

    /// GetLSNReply, DeactivateReply, or ActivateReply from a replica.
    pub(super) fn process_phase_reply(
        &self,
        slot: &mut Slot,
        stage: ReconfigurationStage,
        body: &ReplicaReplyBody,
        _ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu)
                if fu.reconfiguration_stage == stage
                    && fu.description.cc_epoch == body.fu.cc_epoch =>
            {
                fu
            }
            _ => {
                pf_trace!(self.me; "{} stale {:?} reply from {}",
                                   body.fu.failover_unit_id, stage, body.replica.node);
                return Ok(());
            }
        };
        let node = body.replica.node.id;
        if let Some(e) = &body.error {
            if stage == ReconfigurationStage::Phase1GetLsn {
                // no sequence number to count; keep asking
                pf_debug!(self.me; "{} GetLSN failed on {}: {}", fu.id(), node, e);
                return Ok(());
            }
        }
        if !fu.awaiting.remove(&node) {
            return Ok(());
        }
        if stage == ReconfigurationStage::Phase1GetLsn {
            fu.lsn_replied.insert(node);
            if let Some(r) = fu.replica_on_mut(node) {
                r.lsn = body.replica.lsn;
            }
        }
        self.advance_reconfiguration(fu, actions);
        Ok(())
    }

    /// Resends the outstanding messages of a reconfiguration in progress.
    pub(super) fn retry_reconfiguration_messages(
        &self,
        slot: &mut Slot,
        _ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.message_retry.is_set() => fu,
            _ => return Ok(()),
        };
        if !fu.is_reconfiguring() {
            fu.message_retry.set_value(fu.id(), false, actions);
            return Ok(());
        }
        pf_debug!(self.me; "{} resending {} to {} replicas",
                           fu.id(), fu.reconfiguration_stage, fu.awaiting.len());
        self.send_phase_messages(fu, actions);
        Ok(())
    }

    fn reply_to_sender(
        &self,
        msg: &Message,
        body: MessageBody,
        actions: &mut ActionQueue,
    ) {
        actions.send_message(msg.from, Message::new(self.me, body));
    }

    // this node's entry in a configuration, used when no local replica exists
    fn configured_replica(&self, body: &ConfigurationMessageBody) -> Option<ReplicaReplyBody> {
        body.replicas
            .iter()
            .find(|r| r.node.id == self.node.id)
            .map(|r| {
                let mut replica = r.clone();
                replica.mark_dropped();
                ReplicaReplyBody {
                    fu: body.fu.clone(),
                    replica,
                    error: Some("replica not found".into()),
                }
            })
    }

    /// GetLSN from a reconfiguring primary.
    pub(super) fn process_get_lsn(
        &self,
        slot: &mut Slot,
        msg: &Message,
        body: &ConfigurationMessageBody,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let reply = match slot.as_ref() {
            Some(fu) if fu.is_open() && !fu.is_deleted => ReplicaReplyBody {
                fu: body.fu.clone(),
                replica: fu.reply_replica(),
                error: None,
            },
            _ => match self.configured_replica(body) {
                Some(reply) => reply,
                None => return Ok(()),
            },
        };
        self.reply_to_sender(msg, MessageBody::GetLSNReply(reply), actions);
        Ok(())
    }

    /// Deactivate from a reconfiguring primary: the local replica leaves
    /// the configuration.
    pub(super) fn process_deactivate(
        &self,
        slot: &mut Slot,
        msg: &Message,
        body: &ConfigurationMessageBody,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if !fu.is_deleted => fu,
            _ => {
                if let Some(mut reply) = self.configured_replica(body) {
                    reply.error = None;
                    self.reply_to_sender(msg, MessageBody::DeactivateReply(reply), actions);
                }
                return Ok(());
            }
        };
        if body.fu.cc_epoch < fu.description.cc_epoch {
            pf_debug!(self.me; "{} ignoring stale Deactivate {}",
                               fu.id(), body.fu.cc_epoch);
            return Ok(());
        }
        if fu.close_pending.is_set() && fu.close_mode == Some(ReplicaCloseMode::Deactivate) {
            return Ok(());
        }

        let was_primary = fu.local_replica.cc_role == ReplicaRole::Primary;
        fu.description = body.fu.clone();
        self.close_local_replica(
            fu,
            ReplicaCloseMode::Deactivate,
            Some(msg.from),
            ctx,
            actions,
        );
        if was_primary && fu.close_pending.is_set() {
            // an old primary stepping down shows as demoting until closed
            fu.reconfiguration_stage = ReconfigurationStage::Phase0Demote;
        }
        fu.local_replica.cc_role = ReplicaRole::None;
        Ok(())
    }

    /// Activate from a reconfiguring primary: adopt the new configuration.
    pub(super) fn process_activate(
        &self,
        slot: &mut Slot,
        msg: &Message,
        body: &ConfigurationMessageBody,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        let fu = match slot.as_mut() {
            Some(fu) if fu.is_open() && !fu.is_deleted => fu,
            _ => {
                if let Some(reply) = self.configured_replica(body) {
                    self.reply_to_sender(msg, MessageBody::ActivateReply(reply), actions);
                }
                return Ok(());
            }
        };
        if body.fu.cc_epoch < fu.description.cc_epoch {
            pf_debug!(self.me; "{} ignoring stale Activate {}",
                               fu.id(), body.fu.cc_epoch);
            return Ok(());
        }

        if fu.is_reconfiguring() {
            self.abandon_reconfiguration(fu, actions);
        }
        fu.description = body.fu.clone();
        if let Some(entry) = body.replicas.iter().find(|r| r.node.id == self.node.id) {
            if fu.local_replica.cc_role != entry.cc_role {
                pf_info!(self.me; "{} role {:?} -> {:?}",
                                  fu.id(), fu.local_replica.cc_role, entry.cc_role);
            }
            fu.local_replica.cc_role = entry.cc_role;
        }
        fu.local_replica.pc_role = ReplicaRole::None;
        self.update_service_description(fu, &body.service, ctx, actions);

        let reply = ReplicaReplyBody {
            fu: body.fu.clone(),
            replica: fu.reply_replica(),
            error: None,
        };
        self.reply_to_sender(msg, MessageBody::ActivateReply(reply), actions);
        Ok(())
    }
}
