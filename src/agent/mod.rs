//! Reconfiguration agent: runs on every node, opens and closes the node's
//! replicas as the failover managers command, and drives the
//! reconfiguration of partitions whose new primary is local.

mod deactivation;
mod host;
mod lifecycle;
mod local;
mod reconfig;

pub use deactivation::{
    ActivationDecision, CloseMonitor, NodeActivationState,
    NodeDeactivationMessageProcessor,
};
pub use host::{
    HostRequest, HostRequestKind, InProcessHost, ReplicaCloseMode, ReplicaHost,
};
pub use local::{
    LocalFailoverUnit, LocalReplicaQueryResult, ReconfigurationStage,
    ReplicaOpenMode,
};

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use crate::background::{
    EntityJobFactory, EntitySet, EntitySetCollection, EntitySetName,
    IntervalSource, MultipleEntityBackgroundWorkManager, SetSizeGauge,
};
use crate::config::{ConfigHandle, FailoverConfig};
use crate::failover::{FailoverManagerId, FailoverUnitId, NodeInstance};
use crate::health::HealthReportSink;
use crate::jobs::{
    run_state_machine_job, ActionExecutor, ActionQueue, ComponentState,
    FailFastHandler, JobCompletion, JobItem, JobItemCheck, JobItemDescription,
    JobQueueManager, StateMachineAction,
};
use crate::messaging::{
    Endpoint, Message, MessageBody, MessageRetryPipeline, MessageTransport,
    NodeDeactivationInfo, SupersedeKey,
};
use crate::store::{EntityStore, LoadMetrics, PersistentStore};
use crate::utils::FailoverError;

use futures::FutureExt;

use parking_lot::Mutex;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Duration;

/// Inputs shared by one agent transition.
#[derive(Debug, Clone)]
pub(crate) struct AgentContext {
    pub now: SystemTime,
    pub config: FailoverConfig,
}

/// A locked failover unit as seen by a transition: `None` if absent.
/// Setting it to `None` erases the unit.
type Slot = Option<LocalFailoverUnit>;

type Transition = fn(
    &ReconfigurationAgent,
    &mut Slot,
    &AgentContext,
    &mut ActionQueue,
) -> Result<(), FailoverError>;

/// The reconfiguration agent of one node.
pub struct ReconfigurationAgent {
    /// This node and its current instance.
    node: NodeInstance,

    /// Endpoint of this agent; also the logging prefix.
    me: Endpoint,

    config: ConfigHandle,

    /// Local failover units.
    failover_units: EntityStore<FailoverUnitId, LocalFailoverUnit>,

    /// Units awaiting each kind of background work.
    sets: EntitySetCollection,

    /// Background work draining each set.
    workers: OnceLock<HashMap<EntitySetName, Arc<MultipleEntityBackgroundWorkManager>>>,

    /// Serializes all work per failover unit.
    jobs: Arc<JobQueueManager<FailoverUnitId>>,

    transport: Arc<dyn MessageTransport>,

    /// Retries NodeUp until acknowledged.
    pipeline: Arc<MessageRetryPipeline>,

    host: ReplicaHost,

    health: Arc<dyn HealthReportSink>,

    deactivation: NodeDeactivationMessageProcessor,

    state: Mutex<ComponentState>,

    /// Woken after a committed change closes or erases a local unit.
    replica_closed: Notify,

    /// Handle to self for work spawned by action execution.
    weak: Weak<ReconfigurationAgent>,
}

impl ReconfigurationAgent {
    /// Creates the agent of `node`, reloads its local failover units from
    /// `backend`, and announces the node to both failover managers.
    pub async fn new_and_setup(
        node: NodeInstance,
        config: ConfigHandle,
        transport: Arc<dyn MessageTransport>,
        health: Arc<dyn HealthReportSink>,
        host: ReplicaHost,
        fail_fast: Arc<dyn FailFastHandler>,
        backend: Arc<dyn PersistentStore<FailoverUnitId, LocalFailoverUnit>>,
    ) -> Result<Arc<Self>, FailoverError> {
        let me = Endpoint::Node(node.id);
        let failover_units = EntityStore::open(format!("{}-units", me), backend).await?;

        let mut sets = EntitySetCollection::new();
        for name in EntitySetName::ALL {
            sets.add(EntitySet::new(name, Some(SetSizeGauge::new())));
        }

        let agent = Arc::new_cyclic(|weak| ReconfigurationAgent {
            node,
            me,
            config: config.clone(),
            failover_units,
            sets,
            workers: OnceLock::new(),
            jobs: JobQueueManager::new(format!("{}-jobs", me), fail_fast),
            pipeline: MessageRetryPipeline::new(me.to_string(), me, transport.clone()),
            transport,
            host,
            health,
            deactivation: NodeDeactivationMessageProcessor::new(),
            state: Mutex::new(ComponentState::Open),
            replica_closed: Notify::new(),
            weak: weak.clone(),
        });

        let mut workers = HashMap::new();
        for name in EntitySetName::ALL {
            let set = match agent.sets.get(name) {
                Some(set) => set.clone(),
                None => return logged_err!(me; "entity set {} missing", name),
            };
            let (retry, min) = Self::intervals(&config, name);
            workers.insert(
                name,
                MultipleEntityBackgroundWorkManager::new(set, agent.job_factory(name), retry, min),
            );
        }
        let _ = agent.workers.set(workers);

        agent.recover();
        for owner in [FailoverManagerId::Fm, FailoverManagerId::Fmm] {
            agent.send_node_up(owner);
        }

        pf_info!(me; "agent up on {} with {} local units",
                     node, agent.failover_units.len());
        Ok(agent)
    }

    // retry and throttle intervals of each set's background work
    fn intervals(config: &ConfigHandle, name: EntitySetName) -> (IntervalSource, IntervalSource) {
        let (retry, min) = (config.clone(), config.clone());
        match name {
            EntitySetName::ReconfigurationMessageRetry => (
                Box::new(move || retry.get().reconfiguration_message_retry_interval()),
                Box::new(|| Duration::ZERO),
            ),
            EntitySetName::StateCleanup => (
                Box::new(move || retry.get().periodic_state_cleanup_interval()),
                Box::new(move || {
                    min.get().minimum_interval_between_periodic_state_cleanup()
                }),
            ),
            EntitySetName::ReplicaCloseMessageRetry
            | EntitySetName::ReplicaOpenMessageRetry
            | EntitySetName::UpdateServiceDescriptionMessageRetry => (
                Box::new(move || retry.get().rap_message_retry_interval()),
                Box::new(move || min.get().minimum_interval_between_rap_message_retry()),
            ),
        }
    }

    fn job_factory(self: &Arc<Self>, name: EntitySetName) -> EntityJobFactory {
        let weak = Arc::downgrade(self);
        Arc::new(move |id| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(agent) => agent.run_set_job(name, id).await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    async fn run_set_job(
        self: &Arc<Self>,
        name: EntitySetName,
        id: FailoverUnitId,
    ) -> Result<(), FailoverError> {
        let (description, transition): (JobItemDescription, Transition) = match name {
            EntitySetName::ReconfigurationMessageRetry => (
                JobItemDescription::RECONFIGURATION_MESSAGE_RETRY,
                Self::retry_reconfiguration_messages,
            ),
            EntitySetName::StateCleanup => {
                (JobItemDescription::STATE_CLEANUP, Self::state_cleanup)
            }
            EntitySetName::ReplicaCloseMessageRetry => {
                (JobItemDescription::REPLICA_CLOSE_MESSAGE_RETRY, Self::retry_close)
            }
            EntitySetName::ReplicaOpenMessageRetry => {
                (JobItemDescription::REPLICA_OPEN_MESSAGE_RETRY, Self::retry_open)
            }
            EntitySetName::UpdateServiceDescriptionMessageRetry => (
                JobItemDescription::UPDATE_SERVICE_DESCRIPTION_MESSAGE_RETRY,
                Self::retry_service_update,
            ),
        };
        self.enqueue_unit_job(id, description, JobItemCheck::RaIsOpenOrClosing, transition)
            .wait()
            .await
    }

    fn worker(&self, name: EntitySetName) -> Option<&Arc<MultipleEntityBackgroundWorkManager>> {
        self.workers.get().and_then(|workers| workers.get(&name))
    }

    // re-enters persisted set memberships and restarts replicas that were
    // open when the node went down
    fn recover(self: &Arc<Self>) {
        for (id, fu) in self.failover_units.snapshot() {
            self.sets.restore(id, &fu.flags());
            if !fu.is_closed && !fu.is_deleted {
                self.enqueue_unit_job(
                    id,
                    JobItemDescription::LOCAL_RECOVERY,
                    JobItemCheck::RaIsOpenOrClosing,
                    Self::recover_replica,
                );
            }
        }
    }

    pub fn node(&self) -> NodeInstance {
        self.node
    }

    pub fn endpoint(&self) -> Endpoint {
        self.me
    }

    fn component_state(&self) -> ComponentState {
        *self.state.lock()
    }

    /// Runs `transition` on the locked unit `id`. The unit is committed
    /// only if the transition changed it.
    fn enqueue_unit_job<F>(
        self: &Arc<Self>,
        id: FailoverUnitId,
        description: JobItemDescription,
        check: JobItemCheck,
        transition: F,
    ) -> JobCompletion
    where
        F: FnOnce(&Self, &mut Slot, &AgentContext, &mut ActionQueue) -> Result<(), FailoverError>
            + Send
            + 'static,
    {
        let agent = self.clone();
        self.jobs.enqueue(
            id,
            JobItem::new(description, async move {
                let ctx = AgentContext {
                    now: SystemTime::now(),
                    config: agent.config.get(),
                };
                let mut closed = false;
                run_state_machine_job(
                    &agent.failover_units,
                    &id,
                    check,
                    agent.component_state(),
                    ctx.config.lock_acquire_timeout(),
                    agent.as_ref(),
                    |locked, actions| {
                        let committed = locked.get().cloned();
                        let mut slot = committed.clone();
                        transition(agent.as_ref(), &mut slot, &ctx, actions)?;
                        match slot {
                            Some(fu) if committed.as_ref() != Some(&fu) => {
                                closed = fu.is_closed || fu.is_deleted;
                                locked.set(fu);
                            }
                            None if committed.is_some() => {
                                closed = true;
                                locked.mark_for_delete();
                            }
                            _ => {}
                        }
                        Ok(())
                    },
                )
                .await?;

                if closed {
                    agent.replica_closed.notify_waiters();
                }
                Ok(())
            }),
        )
    }

    /// Main event loop: dispatches incoming messages until the channel
    /// closes or a termination signal is caught.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), FailoverError> {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },

                _ = rx_term.changed() => {
                    pf_warn!(self.me; "agent caught termination signal");
                    break;
                }
            }
        }

        self.close();
        Ok(())
    }

    /// Stops all background work and fails queued jobs.
    pub fn close(&self) {
        *self.state.lock() = ComponentState::Closing;
        if let Some(workers) = self.workers.get() {
            for worker in workers.values() {
                worker.close();
            }
        }
        self.deactivation.close();
        self.pipeline.close();
        self.jobs.close();
        *self.state.lock() = ComponentState::Closed;
    }

    /// Routes one incoming message.
    pub fn handle_message(self: &Arc<Self>, msg: Message) {
        pf_trace!(self.me; "recv {}", msg);
        match msg.body {
            MessageBody::NodeUpAck { .. } => {
                self.pipeline.on_reply(msg.request_id, msg);
            }

            MessageBody::ActivateNode(info) => self.on_activate_node(&msg, info),
            MessageBody::DeactivateNode(info) => self.on_deactivate_node(&msg, info),

            _ => match msg.body.failover_unit_id() {
                Some(id) => self.on_unit_message(id, msg),
                None => {
                    pf_debug!(self.me; "ignoring unexpected {}", msg);
                }
            },
        }
    }

    fn on_unit_message(self: &Arc<Self>, id: FailoverUnitId, msg: Message) {
        if let Endpoint::Manager(owner) = msg.from {
            if !self.deactivation.is_ready(owner) {
                pf_debug!(self.me; "not ready for {}, dropping {}", owner, msg.body.name());
                return;
            }
        }
        self.enqueue_unit_job(
            id,
            JobItemDescription::MESSAGE_PROCESSING,
            JobItemCheck::DefaultAndOpen,
            move |agent, slot, ctx, actions| agent.process_message(slot, &msg, ctx, actions),
        );
    }

    fn process_message(
        &self,
        slot: &mut Slot,
        msg: &Message,
        ctx: &AgentContext,
        actions: &mut ActionQueue,
    ) -> Result<(), FailoverError> {
        match &msg.body {
            MessageBody::AddPrimary(body) | MessageBody::AddReplica(body) => {
                self.process_add_replica(slot, msg, body, ctx, actions)
            }
            MessageBody::DeleteReplica(body) => {
                self.process_delete_replica(slot, body, ctx, actions)
            }
            MessageBody::DoReconfiguration(body) => {
                self.process_do_reconfiguration(slot, body, ctx, actions)
            }
            MessageBody::GetLSN(body) => self.process_get_lsn(slot, msg, body, actions),
            MessageBody::Deactivate(body) => {
                self.process_deactivate(slot, msg, body, ctx, actions)
            }
            MessageBody::Activate(body) => {
                self.process_activate(slot, msg, body, ctx, actions)
            }
            MessageBody::GetLSNReply(body) => self.process_phase_reply(
                slot,
                ReconfigurationStage::Phase1GetLsn,
                body,
                ctx,
                actions,
            ),
            MessageBody::DeactivateReply(body) => self.process_phase_reply(
                slot,
                ReconfigurationStage::Phase3Deactivate,
                body,
                ctx,
                actions,
            ),
            MessageBody::ActivateReply(body) => self.process_phase_reply(
                slot,
                ReconfigurationStage::Phase4Activate,
                body,
                ctx,
                actions,
            ),
            other => {
                pf_debug!(self.me; "ignoring {}", other.name());
                Ok(())
            }
        }
    }

    fn send_node_up(self: &Arc<Self>, owner: FailoverManagerId) {
        let request = self.pipeline.begin_request(
            Message::new(self.me, MessageBody::NodeUp { node: self.node }),
            Endpoint::Manager(owner),
            self.config.get().fm_message_retry_interval(),
            Some(SupersedeKey::new(format!("node-up-{}", owner), 0)),
        );
        let agent = self.clone();
        tokio::spawn(async move {
            match request.end().await {
                Ok(reply) => match reply.body {
                    MessageBody::NodeUpAck { info } => agent.on_node_up_ack(owner, info),
                    other => {
                        pf_warn!(agent.me; "unexpected reply {} to NodeUp", other.name());
                    }
                },
                Err(e) => {
                    pf_debug!(agent.me; "NodeUp to {} ended: {}", owner, e);
                }
            }
        });
    }

    fn on_node_up_ack(&self, owner: FailoverManagerId, info: NodeDeactivationInfo) {
        self.deactivation.on_node_up_ack(owner, info);
        pf_info!(self.me; "node up acked by {}, activated {} seq {}",
                          owner, info.is_activated, info.sequence_number);

        // retries held back by the readiness guard can go now
        for name in [
            EntitySetName::ReplicaOpenMessageRetry,
            EntitySetName::ReplicaCloseMessageRetry,
            EntitySetName::UpdateServiceDescriptionMessageRetry,
        ] {
            if let Some(worker) = self.worker(name) {
                worker.request();
            }
        }
    }

    fn on_activate_node(self: &Arc<Self>, msg: &Message, info: NodeDeactivationInfo) {
        let sender = match msg.from {
            Endpoint::Manager(id) => id,
            Endpoint::Node(_) => {
                pf_debug!(self.me; "ActivateNode from non-manager {}", msg.from);
                return;
            }
        };
        match self.deactivation.process_activate(sender, info) {
            ActivationDecision::Activated(current) => {
                pf_info!(self.me; "node activated by {} seq {}",
                                  sender, current.sequence_number);
                self.transport
                    .send(msg.from, msg.reply(self.me, MessageBody::ActivateNodeReply(current)));
                self.reopen_deactivated_replicas();
            }
            ActivationDecision::Duplicate(current) => {
                self.transport
                    .send(msg.from, msg.reply(self.me, MessageBody::ActivateNodeReply(current)));
            }
            decision => {
                pf_debug!(self.me; "ActivateNode {} from {}: {:?}",
                                   info.sequence_number, sender, decision);
            }
        }
    }

    fn on_deactivate_node(self: &Arc<Self>, msg: &Message, info: NodeDeactivationInfo) {
        let sender = match msg.from {
            Endpoint::Manager(id) => id,
            Endpoint::Node(_) => {
                pf_debug!(self.me; "DeactivateNode from non-manager {}", msg.from);
                return;
            }
        };
        match self.deactivation.process_deactivate(sender, info) {
            ActivationDecision::Deactivated(current, monitor) => {
                pf_info!(self.me; "node deactivated by {} seq {}",
                                  sender, current.sequence_number);
                self.close_replicas_of(sender);
                self.spawn_close_monitor(sender, msg.clone(), current, monitor);
            }
            ActivationDecision::Duplicate(current) => {
                self.transport.send(
                    msg.from,
                    msg.reply(self.me, MessageBody::DeactivateNodeReply(current)),
                );
            }
            decision => {
                pf_debug!(self.me; "DeactivateNode {} from {}: {:?}",
                                   info.sequence_number, sender, decision);
            }
        }
    }

    // closes every live replica owned by `owner` for node deactivation
    fn close_replicas_of(self: &Arc<Self>, owner: FailoverManagerId) {
        for (id, fu) in self.failover_units.snapshot() {
            if fu.owner() != owner || fu.is_deleted || fu.is_closed {
                continue;
            }
            self.enqueue_unit_job(
                id,
                JobItemDescription::NODE_ACTIVATION_CHANGE,
                JobItemCheck::RaIsOpenOrClosing,
                |agent, slot, ctx, actions| {
                    if let Some(fu) = slot.as_mut() {
                        if !fu.is_closed && !fu.is_deleted {
                            agent.close_local_replica(
                                fu,
                                ReplicaCloseMode::DeactivateNode,
                                None,
                                ctx,
                                actions,
                            );
                        }
                    }
                    Ok(())
                },
            );
        }
    }

    fn reopen_deactivated_replicas(self: &Arc<Self>) {
        for (id, fu) in self.failover_units.snapshot() {
            if !fu.is_closed_with(ReplicaCloseMode::DeactivateNode) || fu.is_deleted {
                continue;
            }
            self.enqueue_unit_job(
                id,
                JobItemDescription::NODE_ACTIVATION_CHANGE,
                JobItemCheck::RaIsOpenOrClosing,
                |agent, slot, ctx, actions| {
                    if let Some(fu) = slot.as_mut() {
                        if fu.is_closed_with(ReplicaCloseMode::DeactivateNode) {
                            agent.reopen_down_replica(fu, ctx, actions);
                        }
                    }
                    Ok(())
                },
            );
        }
    }

    /// Are all replicas owned by `owner` closed?
    fn all_closed(&self, owner: FailoverManagerId) -> bool {
        self.failover_units
            .snapshot()
            .iter()
            .filter(|(_, fu)| fu.owner() == owner)
            .all(|(_, fu)| fu.is_closed || fu.is_deleted)
    }

    // replies to the deactivation once every replica is closed, unless a
    // newer activation change cancels the monitor first
    fn spawn_close_monitor(
        self: &Arc<Self>,
        owner: FailoverManagerId,
        msg: Message,
        info: NodeDeactivationInfo,
        monitor: CloseMonitor,
    ) {
        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                // registered before the check so no close slips between
                let closed = agent.replica_closed.notified();
                tokio::pin!(closed);
                closed.as_mut().enable();

                if agent.all_closed(owner) {
                    if monitor.try_complete(()) {
                        pf_info!(agent.me; "replicas of {} closed for deactivation {}",
                                           owner, info.sequence_number);
                        agent.transport.send(
                            msg.from,
                            msg.reply(agent.me, MessageBody::DeactivateNodeReply(info)),
                        );
                    }
                    return;
                }

                tokio::select! {
                    _ = monitor.wait() => return,
                    _ = &mut closed => {}
                }
            }
        });
    }

    /// Sends a load report for a local replica to its failover manager.
    pub fn report_load(&self, id: FailoverUnitId, metrics: LoadMetrics) {
        self.transport.send(
            Endpoint::Manager(id.owner()),
            Message::new(
                self.me,
                MessageBody::ReportLoad {
                    failover_unit_id: id,
                    metrics,
                },
            ),
        );
    }

    pub fn query_local_replicas(&self) -> Vec<LocalReplicaQueryResult> {
        self.failover_units
            .snapshot()
            .iter()
            .map(|(_, fu)| LocalReplicaQueryResult::from(fu.as_ref()))
            .collect()
    }

    pub fn query_local_replica(&self, id: &FailoverUnitId) -> Option<Arc<LocalFailoverUnit>> {
        self.failover_units.try_get(id)
    }

    pub fn query_node_activation(&self) -> Vec<(FailoverManagerId, NodeDeactivationInfo)> {
        [FailoverManagerId::Fm, FailoverManagerId::Fmm]
            .into_iter()
            .map(|owner| (owner, self.deactivation.activation_info(owner)))
            .collect()
    }

    /// Number of units waiting in each background work set.
    pub fn query_pending_work(&self) -> Vec<(EntitySetName, usize)> {
        EntitySetName::ALL
            .into_iter()
            .map(|name| (name, self.sets.get(name).map_or(0, |set| set.len())))
            .collect()
    }

    // runs a host request and feeds its result back as a job
    fn dispatch_host_request(&self, request: HostRequest) {
        let agent = match self.weak.upgrade() {
            Some(agent) => agent,
            None => return,
        };
        tokio::spawn(async move {
            let result = agent.host.perform(&request).await;
            let job = agent.enqueue_unit_job(
                request.failover_unit_id,
                JobItemDescription::REPLICA_HOST_REPLY,
                JobItemCheck::RaIsOpenOrClosing,
                move |agent, slot, ctx, actions| {
                    agent.on_host_reply(slot, &request, result, ctx, actions)
                },
            );
            if let Err(e) = job.wait().await {
                pf_debug!(agent.me; "host reply for {} failed: {}", request, e);
            }
        });
    }
}

impl ActionExecutor for ReconfigurationAgent {
    fn execute(&self, action: StateMachineAction) {
        match action {
            StateMachineAction::SendMessage { to, message } => {
                self.transport.send(to, message)
            }
            StateMachineAction::ChangeSetMembership(change) => change.apply(&self.sets),
            StateMachineAction::ReportHealth {
                entity,
                state,
                description,
            } => self.health.report_health(&entity, state, &description),
            StateMachineAction::RequestWork(name) => {
                if let Some(worker) = self.worker(name) {
                    worker.request();
                }
            }
            StateMachineAction::Host(request) => self.dispatch_host_request(request),
        }
    }
}

#[cfg(test)]
mod agent_tests;
