//! Failover manager: owns the authoritative failover unit, node and service
//! caches, drives the per-unit state machine from a background scan, and
//! talks to the agents.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use crate::background::{BackgroundWorkManagerWithRetry, RetryRequest};
use crate::config::ConfigHandle;
use crate::failover::{
    FailoverManagerId, FailoverUnitId, NodeId, NodeInstance, ReplicaDescription,
    ReplicaRole, ServiceDescription,
};
use crate::health::{HealthReportSink, HealthState};
use crate::jobs::{
    run_state_machine_job, ActionExecutor, ActionQueue, ComponentState,
    FailFastHandler, JobCompletion, JobItem, JobItemCheck, JobItemDescription,
    JobQueueManager, StateMachineAction,
};
use crate::manager::placement::{
    apply_replica_difference, run_placement_task, PlacementContext,
};
use crate::manager::tasks::{
    on_add_replica_reply, on_delete_replica_reply, on_do_reconfiguration_reply,
    pending_task, reconfiguration_task, state_update_task, TaskContext,
};
use crate::manager::{FailoverUnit, NodeInfo, ServiceInfo};
use crate::messaging::{
    Endpoint, Message, MessageBody, MessageRetryPipeline, MessageTransport,
    NodeDeactivationInfo, SupersedeKey,
};
use crate::store::{
    EntityStore, LoadInfo, LoadMetrics, LockedCacheEntry, MemoryStore, PersistentStore,
    StoreWrite,
};
use crate::utils::FailoverError;

use futures::future::{join_all, FutureExt};

use parking_lot::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// Durable backends of a failover manager's caches.
pub struct ManagerBackends {
    pub failover_units: Arc<dyn PersistentStore<FailoverUnitId, FailoverUnit>>,
    pub nodes: Arc<dyn PersistentStore<NodeId, NodeInfo>>,
    pub services: Arc<dyn PersistentStore<String, ServiceInfo>>,
    pub loads: Arc<dyn PersistentStore<FailoverUnitId, LoadMetrics>>,
}

impl ManagerBackends {
    pub fn in_memory() -> Self {
        ManagerBackends {
            failover_units: MemoryStore::new(),
            nodes: MemoryStore::new(),
            services: MemoryStore::new(),
            loads: MemoryStore::new(),
        }
    }
}

/// The failover manager (or, for the FM's own partition, the failover
/// manager master).
pub struct FailoverManager {
    /// Which manager this is.
    id: FailoverManagerId,

    /// Endpoint of this manager; also the logging prefix.
    me: Endpoint,

    config: ConfigHandle,

    /// Authoritative failover units.
    failover_units: EntityStore<FailoverUnitId, FailoverUnit>,

    /// Nodes that ever reported up.
    nodes: EntityStore<NodeId, NodeInfo>,

    /// Created services by name.
    services: EntityStore<String, ServiceInfo>,

    /// Reported loads and their durable backend.
    loads: Mutex<HashMap<FailoverUnitId, LoadInfo>>,
    load_store: Arc<dyn PersistentStore<FailoverUnitId, LoadMetrics>>,

    /// Serializes all work per failover unit.
    jobs: Arc<JobQueueManager<FailoverUnitId>>,

    transport: Arc<dyn MessageTransport>,

    /// Retries node activation commands until acknowledged.
    pipeline: Arc<MessageRetryPipeline>,

    health: Arc<dyn HealthReportSink>,

    /// Replicas hosted per node, refreshed at every scan.
    node_load: Mutex<HashMap<NodeId, usize>>,

    /// Time of the last node-down event.
    last_node_down: Mutex<Option<Instant>>,

    state: Mutex<ComponentState>,

    /// Periodic state machine scan.
    scan: OnceLock<Arc<BackgroundWorkManagerWithRetry>>,

    /// Periodic load persistence flush.
    load_flush: OnceLock<Arc<BackgroundWorkManagerWithRetry>>,
}

impl FailoverManager {
    /// Creates a manager, loads its caches from `backends`, and starts its
    /// background scan and load flush.
    pub async fn new_and_setup(
        id: FailoverManagerId,
        config: ConfigHandle,
        transport: Arc<dyn MessageTransport>,
        health: Arc<dyn HealthReportSink>,
        fail_fast: Arc<dyn FailFastHandler>,
        backends: ManagerBackends,
    ) -> Result<Arc<Self>, FailoverError> {
        let me = Endpoint::Manager(id);
        let failover_units =
            EntityStore::open(format!("{}-units", me), backends.failover_units).await?;
        let nodes = EntityStore::open(format!("{}-nodes", me), backends.nodes).await?;
        let services =
            EntityStore::open(format!("{}-services", me), backends.services).await?;
        let loads: HashMap<FailoverUnitId, LoadInfo> = backends
            .loads
            .load_all()
            .await?
            .into_iter()
            .map(|(fu, metrics)| (fu, LoadInfo::recovered(fu, metrics)))
            .collect();

        let manager = Arc::new(FailoverManager {
            id,
            me,
            config: config.clone(),
            failover_units,
            nodes,
            services,
            loads: Mutex::new(loads),
            load_store: backends.loads,
            jobs: JobQueueManager::new(format!("{}-jobs", me), fail_fast),
            pipeline: MessageRetryPipeline::new(me.to_string(), me, transport.clone()),
            transport,
            health,
            node_load: Mutex::new(HashMap::new()),
            last_node_down: Mutex::new(None),
            state: Mutex::new(ComponentState::Open),
            scan: OnceLock::new(),
            load_flush: OnceLock::new(),
        });

        let weak = Arc::downgrade(&manager);
        let scan_config = config.clone();
        let scan = BackgroundWorkManagerWithRetry::new(
            format!("{}-scan", me),
            Box::new(move || {
                let weak: Weak<FailoverManager> = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => {
                            manager.run_state_machine_pass().await;
                            RetryRequest::Timer
                        }
                        None => RetryRequest::None,
                    }
                }
                .boxed()
            }),
            Box::new(move || scan_config.get().fm_background_scan_interval()),
            Box::new(|| Duration::ZERO),
        );

        let weak = Arc::downgrade(&manager);
        let flush_config = config;
        let load_flush = BackgroundWorkManagerWithRetry::new(
            format!("{}-loads", me),
            Box::new(move || {
                let weak: Weak<FailoverManager> = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => {
                            if let Err(e) = manager.flush_loads().await {
                                pf_warn!(manager.me; "load flush failed: {}", e);
                            }
                            RetryRequest::Timer
                        }
                        None => RetryRequest::None,
                    }
                }
                .boxed()
            }),
            Box::new(move || flush_config.get().load_persist_interval()),
            Box::new(|| Duration::ZERO),
        );

        scan.request();
        load_flush.request();
        let _ = manager.scan.set(scan);
        let _ = manager.load_flush.set(load_flush);

        pf_info!(me; "manager up with {} failover units, {} nodes",
                     manager.failover_units.len(), manager.nodes.len());
        Ok(manager)
    }

    pub fn id(&self) -> FailoverManagerId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.me
    }

    fn component_state(&self) -> ComponentState {
        *self.state.lock()
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
                    pf_warn!(self.me; "manager caught termination signal");
                    break;
                }
            }
        }

        self.close();
        Ok(())
    }

    /// Stops background work and fails all queued jobs.
    pub fn close(&self) {
        *self.state.lock() = ComponentState::Closed;
        if let Some(scan) = self.scan.get() {
            scan.close();
        }
        if let Some(flush) = self.load_flush.get() {
            flush.close();
        }
        self.pipeline.close();
        self.jobs.close();
    }

    /// Routes one incoming message.
    pub fn handle_message(self: &Arc<Self>, msg: Message) {
        pf_trace!(self.me; "recv {}", msg);
        match msg.body.clone() {
            MessageBody::NodeUp { node } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.process_node_up(&msg, node).await {
                        pf_warn!(manager.me; "NodeUp from {} failed: {}", node, e);
                    }
                });
            }

            MessageBody::ActivateNodeReply(_) | MessageBody::DeactivateNodeReply(_) => {
                self.pipeline.on_reply(msg.request_id, msg);
            }

            MessageBody::ReportLoad {
                failover_unit_id,
                metrics,
            } => self.on_report_load(failover_unit_id, metrics),

            MessageBody::AddPrimaryReply(reply) | MessageBody::AddReplicaReply(reply) => {
                self.enqueue_unit_job(
                    reply.fu.failover_unit_id,
                    JobItemDescription::FM_MESSAGE,
                    move |_, fu, ctx, _| {
                        on_add_replica_reply(fu, &reply, ctx);
                        false
                    },
                );
            }

            MessageBody::DeleteReplicaReply(reply) => {
                self.enqueue_unit_job(
                    reply.fu.failover_unit_id,
                    JobItemDescription::FM_MESSAGE,
                    move |_, fu, ctx, _| on_delete_replica_reply(fu, &reply, ctx),
                );
            }

            MessageBody::DoReconfigurationReply(reply) => {
                self.enqueue_unit_job(
                    reply.fu.failover_unit_id,
                    JobItemDescription::FM_MESSAGE,
                    move |_, fu, ctx, _| {
                        on_do_reconfiguration_reply(fu, &reply, ctx);
                        false
                    },
                );
            }

            _ => {
                pf_debug!(self.me; "ignoring unexpected {}", msg);
            }
        }
    }

    /// Runs `edit` on a working copy of the failover unit under its lock.
    /// The copy is committed only if it changed; `edit` returning true
    /// erases the unit.
    fn enqueue_unit_job<F>(
        self: &Arc<Self>,
        id: FailoverUnitId,
        description: JobItemDescription,
        edit: F,
    ) -> JobCompletion
    where
        F: FnOnce(&Self, &mut FailoverUnit, &TaskContext, &mut ActionQueue) -> bool
            + Send
            + 'static,
    {
        let manager = self.clone();
        self.jobs.enqueue(
            id,
            JobItem::new(description, async move {
                let config = manager.config.get();
                let component = manager.component_state();
                let mut erased = false;
                run_state_machine_job(
                    &manager.failover_units,
                    &id,
                    JobItemCheck::FtIsNotNull,
                    component,
                    config.lock_acquire_timeout(),
                    manager.as_ref(),
                    |locked, actions| {
                        let committed = match locked.get() {
                            Some(fu) => fu.clone(),
                            None => return Ok(()),
                        };
                        let ctx = TaskContext {
                            me: manager.me,
                            now: SystemTime::now(),
                            config: &config,
                        };
                        let mut fu = committed.clone();
                        if edit(manager.as_ref(), &mut fu, &ctx, actions) {
                            pf_info!(manager.me; "erasing deleted {}", id);
                            locked.mark_for_delete();
                            erased = true;
                        } else if fu != committed {
                            fu.bump_version();
                            locked.set(fu);
                        }
                        Ok(())
                    },
                )
                .await?;

                // the load record goes only once the erase is durable
                if erased {
                    manager.remove_load(id);
                }
                Ok(())
            }),
        )
    }

    /// One state machine pass over every failover unit. Returns the number
    /// of units whose job failed.
    pub async fn run_state_machine_pass(self: &Arc<Self>) -> usize {
        if self.component_state() != ComponentState::Open {
            return 0;
        }
        self.refresh_node_load();

        let completions: Vec<JobCompletion> = self
            .failover_units
            .keys()
            .into_iter()
            .map(|id| {
                self.enqueue_unit_job(
                    id,
                    JobItemDescription::FM_STATE_MACHINE,
                    |manager, fu, ctx, actions| manager.state_machine(fu, ctx, actions),
                )
            })
            .collect();
        let results = join_all(completions.into_iter().map(|c| c.wait())).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            pf_debug!(self.me; "state machine pass: {} of {} failed",
                               failed, results.len());
        }
        failed
    }

    // the ordered task list run on each unit every scan
    fn state_machine(
        &self,
        fu: &mut FailoverUnit,
        ctx: &TaskContext,
        actions: &mut ActionQueue,
    ) -> bool {
        state_update_task(fu, ctx);
        reconfiguration_task(fu, ctx, actions);

        let placement = PlacementContext {
            now: ctx.now,
            replica_restart_wait: ctx.config.replica_restart_wait_duration(),
            is_node_cache_stable: self.is_node_cache_stable(ctx),
            allow_singleton_move: ctx.config.is_singleton_replica_move_allowed_during_upgrade,
        };
        run_placement_task(fu, &placement);
        let nodes: HashMap<NodeId, NodeInfo> = self
            .nodes
            .snapshot()
            .into_iter()
            .map(|(id, info)| (id, NodeInfo::clone(&info)))
            .collect();
        let placed = {
            let mut load = self.node_load.lock();
            apply_replica_difference(fu, &nodes, &mut load, ctx.now)
        };
        if let Err(e) = placed {
            pf_debug!(self.me; "placement of {}: {}", fu.id(), e);
            actions.report_health(
                format!("partition/{}", fu.id()),
                HealthState::Warning,
                e.to_string(),
            );
        }

        pending_task(fu, ctx, actions)
    }

    fn refresh_node_load(&self) {
        let mut load: HashMap<NodeId, usize> = HashMap::new();
        for (_, fu) in self.failover_units.snapshot() {
            for r in fu.replicas.iter().filter(|r| !r.is_dropped()) {
                *load.entry(r.node.id).or_insert(0) += 1;
            }
        }
        *self.node_load.lock() = load;
    }

    // no node went down within the restart wait
    fn is_node_cache_stable(&self, ctx: &TaskContext) -> bool {
        let any_up = self.nodes.snapshot().iter().any(|(_, n)| n.is_up);
        let quiet = match *self.last_node_down.lock() {
            Some(t) => t.elapsed() >= ctx.config.replica_restart_wait_duration(),
            None => true,
        };
        any_up && quiet
    }

    fn request_scan(&self) {
        if let Some(scan) = self.scan.get() {
            scan.request();
        }
    }

    /// Creates a service and one failover unit per partition. The FMM
    /// creates only the FM partition.
    pub async fn create_service(
        self: &Arc<Self>,
        description: ServiceDescription,
    ) -> Result<Vec<FailoverUnitId>, FailoverError> {
        if description.partition_count == 0
            || description.target_replica_set_size == 0
            || description.min_replica_set_size > description.target_replica_set_size
        {
            return Err(FailoverError::InvalidState(format!(
                "invalid service description for {}",
                description.name
            )));
        }

        let timeout = self.config.get().lock_acquire_timeout();
        let mut service = self
            .services
            .lock_or_create(&description.name, timeout)
            .await?;
        if service.exists() {
            return Err(FailoverError::InvalidState(format!(
                "service {} already exists",
                description.name
            )));
        }

        let ids: Vec<FailoverUnitId> = if self.id.is_fmm() {
            vec![FailoverUnitId::fm()]
        } else {
            (0..description.partition_count)
                .map(|_| FailoverUnitId::new())
                .collect()
        };
        // every partition lands in one batch, locked in ascending key order
        let mut sorted = ids.clone();
        sorted.sort();
        let mut units = Vec::with_capacity(sorted.len());
        for id in &sorted {
            let mut locked = self.failover_units.lock_or_create(id, timeout).await?;
            locked.set(FailoverUnit::new(*id, description.clone()));
            units.push(locked);
        }
        let committed = {
            let mut batch: Vec<&mut LockedCacheEntry<FailoverUnitId, FailoverUnit>> =
                units.iter_mut().collect();
            self.failover_units.commit_transaction(&mut batch).await
        };
        if let Err(e) = committed {
            for locked in units {
                self.failover_units.release(locked);
            }
            self.services.release(service);
            return Err(e);
        }

        service.set(ServiceInfo {
            description: description.clone(),
            failover_units: ids.clone(),
        });
        if let Err(e) = self.services.commit(&mut service).await {
            pf_warn!(self.me; "service {} not recorded, erasing its partitions: {}",
                              description.name, e);
            for locked in units.iter_mut() {
                locked.mark_for_delete();
            }
            let mut batch: Vec<&mut LockedCacheEntry<FailoverUnitId, FailoverUnit>> =
                units.iter_mut().collect();
            if let Err(ee) = self.failover_units.commit_transaction(&mut batch).await {
                pf_error!(self.me; "erasing partitions of {} failed: {}",
                                   description.name, ee);
            }
            self.services.release(service);
            return Err(e);
        }
        drop(units);
        drop(service);

        pf_info!(self.me; "created service {} with {} partitions",
                          description.name, ids.len());
        self.request_scan();
        Ok(ids)
    }

    /// Marks every partition of the service ToBeDeleted and forgets the
    /// service. Partitions are erased once their replicas are deleted.
    pub async fn delete_service(self: &Arc<Self>, name: &str) -> Result<(), FailoverError> {
        let timeout = self.config.get().lock_acquire_timeout();
        let mut service = self.services.lock(&name.to_string(), timeout).await?;
        let ids = match service.get() {
            Some(info) => info.failover_units.clone(),
            None => {
                return Err(FailoverError::NotFound(format!("service {}", name)));
            }
        };

        let completions: Vec<JobCompletion> = ids
            .into_iter()
            .map(|id| {
                self.enqueue_unit_job(id, JobItemDescription::FM_MESSAGE, |_, fu, _, _| {
                    fu.is_to_be_deleted = true;
                    false
                })
            })
            .collect();
        for completion in completions {
            completion.wait().await?;
        }

        service.mark_for_delete();
        self.services.commit(&mut service).await?;
        drop(service);

        pf_info!(self.me; "deleting service {}", name);
        self.request_scan();
        Ok(())
    }

    async fn process_node_up(
        self: &Arc<Self>,
        msg: &Message,
        node: NodeInstance,
    ) -> Result<(), FailoverError> {
        let timeout = self.config.get().lock_acquire_timeout();
        let mut locked = self.nodes.lock_or_create(&node.id, timeout).await?;
        let (info, restarted) = match locked.get() {
            Some(known) => {
                let mut info = known.clone();
                let restarted = info.node.instance != node.instance;
                info.node = node;
                info.is_up = true;
                (info, restarted)
            }
            None => (NodeInfo::new(node), false),
        };
        let ack = NodeDeactivationInfo {
            is_activated: info.is_activated,
            sequence_number: info.activation_sequence,
        };
        locked.set(info);
        self.nodes.commit(&mut locked).await?;
        drop(locked);

        if restarted {
            pf_info!(self.me; "node {} restarted", node);
            self.mark_replicas_down(node.id).await;
        }
        self.transport.send(
            msg.from,
            msg.reply(self.me, MessageBody::NodeUpAck { info: ack }),
        );
        self.request_scan();
        Ok(())
    }

    /// Records that a node went down; its replicas are marked down.
    pub async fn node_down(self: &Arc<Self>, node: NodeId) -> Result<(), FailoverError> {
        let timeout = self.config.get().lock_acquire_timeout();
        let mut locked = self.nodes.lock(&node, timeout).await?;
        if let Some(info) = locked.enable_update() {
            info.is_up = false;
            info.last_down_time = Some(SystemTime::now());
        }
        self.nodes.commit(&mut locked).await?;
        drop(locked);

        *self.last_node_down.lock() = Some(Instant::now());
        pf_info!(self.me; "node {} down", node);
        self.mark_replicas_down(node).await;
        self.request_scan();
        Ok(())
    }

    async fn mark_replicas_down(self: &Arc<Self>, node: NodeId) {
        self.edit_replicas_on(node, |r, now| r.mark_down(now)).await;
    }

    // runs `edit` on the replica on `node` of every unit hosting one
    async fn edit_replicas_on<E>(self: &Arc<Self>, node: NodeId, edit: E)
    where
        E: Fn(&mut ReplicaDescription, SystemTime)
            + Clone
            + Send
            + 'static,
    {
        let completions: Vec<JobCompletion> = self
            .failover_units
            .snapshot()
            .into_iter()
            .filter(|(_, fu)| fu.hosts_replica_on(node))
            .map(|(id, _)| {
                let edit = edit.clone();
                self.enqueue_unit_job(
                    id,
                    JobItemDescription::FM_MESSAGE,
                    move |_, fu, ctx, _| {
                        if let Some(r) = fu.replica_on_mut(node) {
                            edit(r, ctx.now);
                        }
                        false
                    },
                )
            })
            .collect();
        for completion in completions {
            if let Err(e) = completion.wait().await {
                pf_debug!(self.me; "replica update on node {} failed: {}", node, e);
            }
        }
    }

    pub async fn deactivate_node(self: &Arc<Self>, node: NodeId) -> Result<i64, FailoverError> {
        self.change_node_activation(node, false).await
    }

    pub async fn activate_node(self: &Arc<Self>, node: NodeId) -> Result<i64, FailoverError> {
        self.change_node_activation(node, true).await
    }

    /// Bumps the node's activation sequence, flags its replicas, and sends
    /// the command until the node acknowledges it or a newer command
    /// supersedes it. Returns the new sequence number.
    async fn change_node_activation(
        self: &Arc<Self>,
        node: NodeId,
        activate: bool,
    ) -> Result<i64, FailoverError> {
        let config = self.config.get();
        let mut locked = self.nodes.lock(&node, config.lock_acquire_timeout()).await?;
        let info = match locked.enable_update() {
            Some(info) => {
                info.is_activated = activate;
                info.activation_sequence += 1;
                info.is_activation_acked = false;
                NodeDeactivationInfo {
                    is_activated: activate,
                    sequence_number: info.activation_sequence,
                }
            }
            None => return Err(FailoverError::NotFound(format!("node {}", node))),
        };
        self.nodes.commit(&mut locked).await?;
        drop(locked);

        pf_info!(self.me; "{} node {} seq {}",
                          if activate { "activating" } else { "deactivating" },
                          node, info.sequence_number);
        self.edit_replicas_on(node, move |r, _| {
            if activate {
                r.is_primary_to_be_swapped_out = false;
                if r.is_in_configuration() {
                    r.is_to_be_dropped = false;
                }
            } else if r.cc_role == ReplicaRole::Primary {
                r.is_primary_to_be_swapped_out = true;
            } else if !r.is_dropped() {
                r.is_to_be_dropped = true;
            }
        })
        .await;

        let body = if activate {
            MessageBody::ActivateNode(info)
        } else {
            MessageBody::DeactivateNode(info)
        };
        let request = self.pipeline.begin_request(
            Message::new(self.me, body),
            Endpoint::Node(node),
            config.fm_message_retry_interval(),
            Some(SupersedeKey::new(format!("node-{}", node), info.sequence_number)),
        );
        let manager = self.clone();
        let seq = info.sequence_number;
        tokio::spawn(async move {
            match request.end().await {
                Ok(_) => {
                    if let Err(e) = manager.on_activation_acked(node, seq).await {
                        pf_warn!(manager.me; "recording ack of node {}: {}", node, e);
                    }
                }
                Err(e) if e.is_stale() => {
                    pf_debug!(manager.me; "activation {} of node {} superseded", seq, node);
                }
                Err(e) => {
                    pf_debug!(manager.me; "activation {} of node {} ended: {}", seq, node, e);
                }
            }
        });

        self.request_scan();
        Ok(seq)
    }

    async fn on_activation_acked(&self, node: NodeId, seq: i64) -> Result<(), FailoverError> {
        let timeout = self.config.get().lock_acquire_timeout();
        let mut locked = self.nodes.lock(&node, timeout).await?;
        let current = locked.get().map(|info| info.activation_sequence);
        if current == Some(seq) {
            if let Some(info) = locked.enable_update() {
                info.is_activation_acked = true;
            }
            self.nodes.commit(&mut locked).await?;
            pf_debug!(self.me; "node {} acked activation {}", node, seq);
        }
        Ok(())
    }

    fn on_report_load(&self, id: FailoverUnitId, metrics: LoadMetrics) {
        if self.failover_units.try_get(&id).is_none() {
            pf_debug!(self.me; "load for unknown {}", id);
            return;
        }
        let mut loads = self.loads.lock();
        match loads.get_mut(&id) {
            Some(load) => load.update(metrics),
            None => {
                loads.insert(id, LoadInfo::new(id, metrics));
            }
        }
    }

    fn remove_load(&self, id: FailoverUnitId) {
        if let Some(load) = self.loads.lock().get_mut(&id) {
            load.mark_for_delete();
        }
    }

    /// Persists every pending load change as one batch.
    pub async fn flush_loads(&self) -> Result<usize, FailoverError> {
        let mut batch: Vec<FailoverUnitId> = vec![];
        let mut writes: Vec<StoreWrite<FailoverUnitId, LoadMetrics>> = vec![];
        {
            let mut loads = self.loads.lock();
            for (id, load) in loads.iter_mut() {
                if !load.is_pending() || load.is_updating() {
                    continue;
                }
                if let Some(write) = load.start_persist()? {
                    writes.push(write);
                }
                batch.push(*id);
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let result = if writes.is_empty() {
            Ok(())
        } else {
            self.load_store.commit(writes).await
        };
        let success = result.is_ok();
        {
            let mut loads = self.loads.lock();
            for id in &batch {
                if let Some(load) = loads.get_mut(id) {
                    load.on_persist_completed(success)?;
                }
            }
            loads.retain(|_, load| !load.is_deleted());
        }
        result.map(|_| batch.len())
    }

    pub fn query_failover_unit(&self, id: &FailoverUnitId) -> Option<Arc<FailoverUnit>> {
        self.failover_units.try_get(id)
    }

    pub fn query_failover_units(&self) -> Vec<Arc<FailoverUnit>> {
        self.failover_units
            .snapshot()
            .into_iter()
            .map(|(_, fu)| fu)
            .collect()
    }

    pub fn query_nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.nodes.snapshot().into_iter().map(|(_, n)| n).collect()
    }

    pub fn query_service(&self, name: &str) -> Option<Arc<ServiceInfo>> {
        self.services.try_get(&name.to_string())
    }

    pub fn query_load(&self, id: &FailoverUnitId) -> Option<LoadMetrics> {
        self.loads.lock().get(id).map(|l| l.metrics())
    }
}

impl ActionExecutor for FailoverManager {
    fn execute(&self, action: StateMachineAction) {
        match action {
            StateMachineAction::SendMessage { to, message } => {
                self.transport.send(to, message)
            }
            StateMachineAction::ReportHealth {
                entity,
                state,
                description,
            } => self.health.report_health(&entity, state, &description),
            other => {
                pf_warn!(self.me; "unexpected action {:?}", other);
            }
        }
    }
}
