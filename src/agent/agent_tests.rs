use super::*;
use crate::failover::{
    ConsistencyUnitDescription, Epoch, FailoverUnitDescription, NodeId,
    ReplicaDescription, ReplicaRole, ReplicaState, ServiceDescription,
};
use crate::health::{CollectingHealthSink, HealthState};
use crate::jobs::RecordingFailFast;
use crate::messaging::{
    ConfigurationMessageBody, InMemoryNetwork, ReplicaMessageBody, ReplicaReplyBody,
};
use crate::store::MemoryStore;
use tokio::time::{self, timeout};
use uuid::Uuid;
use FailoverManagerId::{Fm, Fmm};

type UnitBackend = Arc<MemoryStore<FailoverUnitId, LocalFailoverUnit>>;

struct Harness {
    net: Arc<InMemoryNetwork>,
    agent: Arc<ReconfigurationAgent>,
    fm_rx: mpsc::UnboundedReceiver<Message>,
    fmm_rx: mpsc::UnboundedReceiver<Message>,
    health: Arc<CollectingHealthSink>,
    host: Arc<InProcessHost>,
    _tx_term: watch::Sender<bool>,
}

fn test_config() -> FailoverConfig {
    let mut config = FailoverConfig::default();
    config.fm_message_retry_interval_ms = 50;
    config.rap_message_retry_interval_ms = 50;
    config.minimum_interval_between_rap_message_retry_ms = 10;
    config.reconfiguration_message_retry_interval_ms = 100;
    config.periodic_state_cleanup_interval_ms = 50;
    config.minimum_interval_between_periodic_state_cleanup_ms = 10;
    config.deleted_failover_unit_tombstone_duration_ms = 300;
    config
}

async fn harness_on(
    node: NodeId,
    backend: UnitBackend,
    host: Arc<InProcessHost>,
) -> Result<Harness, FailoverError> {
    harness_with(node, test_config(), backend, host).await
}

async fn harness_with(
    node: NodeId,
    config: FailoverConfig,
    backend: UnitBackend,
    host: Arc<InProcessHost>,
) -> Result<Harness, FailoverError> {
    let net = InMemoryNetwork::new();
    let fm_rx = net.register(Endpoint::Manager(Fm));
    let fmm_rx = net.register(Endpoint::Manager(Fmm));
    let health = CollectingHealthSink::new();
    let agent = ReconfigurationAgent::new_and_setup(
        NodeInstance::new(node, 1),
        ConfigHandle::new(config),
        net.clone(),
        health.clone(),
        ReplicaHost::InProcess(host.clone()),
        RecordingFailFast::new(),
        backend,
    )
    .await?;
    let rx = net.register(agent.endpoint());
    let (tx_term, rx_term) = watch::channel(false);
    tokio::spawn(agent.clone().run(rx, rx_term));
    Ok(Harness {
        net,
        agent,
        fm_rx,
        fmm_rx,
        health,
        host,
        _tx_term: tx_term,
    })
}

async fn harness(node: NodeId) -> Result<Harness, FailoverError> {
    harness_on(node, MemoryStore::new(), InProcessHost::new()).await
}

/// Receives until a message matching `pred` shows up, skipping NodeUp
/// retries and anything else.
async fn expect<F>(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    pred: F,
) -> Result<Message, FailoverError>
where
    F: Fn(&MessageBody) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Some(msg) if pred(&msg.body) => return Ok(msg),
                Some(_) => continue,
                None => return Err(FailoverError::msg("channel closed")),
            }
        }
    })
    .await?
}

async fn wait_until<F>(mut cond: F) -> Result<(), FailoverError>
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if cond() {
            return Ok(());
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    Err(FailoverError::Timeout("condition not reached".into()))
}

fn activation(is_activated: bool, sequence_number: i64) -> NodeDeactivationInfo {
    NodeDeactivationInfo {
        is_activated,
        sequence_number,
    }
}

async fn ack_node_up(h: &mut Harness, owner: FailoverManagerId) -> Result<(), FailoverError> {
    let rx = match owner {
        Fm => &mut h.fm_rx,
        Fmm => &mut h.fmm_rx,
    };
    let up = expect(rx, |b| matches!(b, MessageBody::NodeUp { .. })).await?;
    let ack = up.reply(
        Endpoint::Manager(owner),
        MessageBody::NodeUpAck {
            info: activation(true, 0),
        },
    );
    h.net.send(h.agent.endpoint(), ack);
    let agent = h.agent.clone();
    wait_until(|| agent.deactivation.is_ready(owner)).await
}

fn from_fm(h: &Harness, body: MessageBody) {
    h.net
        .send(h.agent.endpoint(), Message::new(Endpoint::Manager(Fm), body));
}

fn build_body(id: FailoverUnitId, node: NodeId, replica_id: i64) -> ReplicaMessageBody {
    ReplicaMessageBody {
        fu: FailoverUnitDescription::new(
            id,
            ConsistencyUnitDescription::singleton(Uuid::new_v4()),
            3,
            2,
        ),
        replica: ReplicaDescription::new_in_build(
            NodeInstance::new(node, 1),
            replica_id,
            ReplicaRole::Primary,
            SystemTime::now(),
        ),
        service: ServiceDescription::new_stateful("svc", 1, 3, 2),
    }
}

async fn open_primary(h: &mut Harness, body: &ReplicaMessageBody) -> Result<(), FailoverError> {
    from_fm(h, MessageBody::AddPrimary(body.clone()));
    let reply = expect(&mut h.fm_rx, |b| matches!(b, MessageBody::AddPrimaryReply(_))).await?;
    match reply.body {
        MessageBody::AddPrimaryReply(r) => {
            assert!(r.error.is_none());
            assert_eq!(r.replica.state, ReplicaState::Ready);
        }
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opens_replica_and_replies() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 7);
    open_primary(&mut h, &body).await?;
    assert!(h.host.is_open(&id));

    let local = h.agent.query_local_replicas();
    assert_eq!(local.len(), 1);
    assert!(local[0].is_open);
    assert_eq!(local[0].role, ReplicaRole::Primary);
    assert_eq!(local[0].replica_id, 7);

    // a duplicate build is answered again
    open_primary(&mut h, &body).await?;
    assert_eq!(h.host.open_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fm_messages_dropped_until_ready() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 1);
    from_fm(&h, MessageBody::AddPrimary(body.clone()));
    time::sleep(Duration::from_millis(200)).await;
    assert!(h.agent.query_local_replica(&id).is_none());

    ack_node_up(&mut h, Fm).await?;
    // FMM readiness does not matter to a regular partition
    assert!(!h.agent.deactivation.is_ready(Fmm));
    open_primary(&mut h, &body).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn open_failure_replies_error() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    h.host.fail_next_opens(1);
    let id = FailoverUnitId::new();
    from_fm(&h, MessageBody::AddReplica(build_body(id, 1, 3)));

    let reply = expect(&mut h.fm_rx, |b| matches!(b, MessageBody::AddReplicaReply(_))).await?;
    match reply.body {
        MessageBody::AddReplicaReply(r) => {
            assert!(r.error.is_some());
            assert!(r.replica.is_dropped());
        }
        _ => unreachable!(),
    }
    let fu = h
        .agent
        .query_local_replica(&id)
        .ok_or_else(|| FailoverError::msg("unit missing"))?;
    assert!(fu.is_deleted);
    assert_eq!(fu.open_failures.count(), 1);

    let entity = format!("replica/{}/1", id);
    let report = h
        .health
        .latest(&entity)
        .ok_or_else(|| FailoverError::msg("no health report"))?;
    assert_eq!(report.state, HealthState::Ok);
    assert!(!h.host.is_open(&id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivate_then_activate_node() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let id = FailoverUnitId::new();
    open_primary(&mut h, &build_body(id, 1, 1)).await?;

    from_fm(&h, MessageBody::DeactivateNode(activation(false, 1)));
    let reply = expect(&mut h.fm_rx, |b| {
        matches!(b, MessageBody::DeactivateNodeReply(_))
    })
    .await?;
    assert!(matches!(
        reply.body,
        MessageBody::DeactivateNodeReply(info) if info == activation(false, 1)
    ));
    let fu = h
        .agent
        .query_local_replica(&id)
        .ok_or_else(|| FailoverError::msg("unit missing"))?;
    assert!(fu.is_closed_with(ReplicaCloseMode::DeactivateNode));

    // no builds while deactivated
    let other = FailoverUnitId::new();
    from_fm(&h, MessageBody::AddReplica(build_body(other, 1, 2)));
    let reply = expect(&mut h.fm_rx, |b| matches!(b, MessageBody::AddReplicaReply(_))).await?;
    assert!(matches!(reply.body, MessageBody::AddReplicaReply(r) if r.error.is_some()));

    from_fm(&h, MessageBody::ActivateNode(activation(true, 2)));
    expect(&mut h.fm_rx, |b| matches!(b, MessageBody::ActivateNodeReply(_))).await?;
    let agent = h.agent.clone();
    wait_until(|| {
        agent
            .query_local_replica(&id)
            .map_or(false, |fu| fu.is_open() && !fu.open_pending.is_set())
    })
    .await?;
    assert_eq!(
        h.agent.query_node_activation(),
        vec![(Fm, activation(true, 2)), (Fmm, activation(true, 2))]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivation_reply_follows_last_close() -> Result<(), FailoverError> {
    // retries are far off, so only the close itself can wake the monitor
    let mut config = test_config();
    config.rap_message_retry_interval_ms = 10_000;
    config.minimum_interval_between_rap_message_retry_ms = 10_000;
    let mut h = harness_with(1, config, MemoryStore::new(), InProcessHost::new()).await?;
    ack_node_up(&mut h, Fm).await?;
    let first = FailoverUnitId::new();
    let second = FailoverUnitId::new();
    open_primary(&mut h, &build_body(first, 1, 1)).await?;
    open_primary(&mut h, &build_body(second, 1, 2)).await?;

    h.host.set_delay(Duration::from_millis(100));
    let start = time::Instant::now();
    from_fm(&h, MessageBody::DeactivateNode(activation(false, 1)));
    expect(&mut h.fm_rx, |b| {
        matches!(b, MessageBody::DeactivateNodeReply(_))
    })
    .await?;
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(2));
    for id in [first, second] {
        let fu = h
            .agent
            .query_local_replica(&id)
            .ok_or_else(|| FailoverError::msg("unit missing"))?;
        assert!(fu.is_closed_with(ReplicaCloseMode::DeactivateNode));
        assert!(!h.host.is_open(&id));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_leaves_tombstone_until_cleanup() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 4);
    open_primary(&mut h, &body).await?;

    from_fm(&h, MessageBody::DeleteReplica(body.clone()));
    let reply = expect(&mut h.fm_rx, |b| {
        matches!(b, MessageBody::DeleteReplicaReply(_))
    })
    .await?;
    assert!(matches!(reply.body, MessageBody::DeleteReplicaReply(r) if r.error.is_none()));
    assert!(!h.host.is_open(&id));

    let agent = h.agent.clone();
    wait_until(|| agent.query_local_replica(&id).is_none()).await?;

    // deleting something unknown is acknowledged right away
    from_fm(&h, MessageBody::DeleteReplica(body));
    expect(&mut h.fm_rx, |b| matches!(b, MessageBody::DeleteReplicaReply(_))).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_close_retried() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 5);
    open_primary(&mut h, &body).await?;

    h.host.fail_next_closes(2);
    from_fm(&h, MessageBody::DeleteReplica(body));
    expect(&mut h.fm_rx, |b| matches!(b, MessageBody::DeleteReplicaReply(_))).await?;
    assert!(!h.host.is_open(&id));

    // two failures, then the success clears them
    let entity = format!("replica/{}/1", id);
    let reports: Vec<_> = h
        .health
        .history()
        .into_iter()
        .filter(|r| r.entity == entity)
        .collect();
    assert_eq!(reports.len(), 3);
    assert!(reports[1].description.contains("close failed 2 times"));
    assert_eq!(reports[2].description, "replica closed");
    Ok(())
}

fn member(node: NodeId, pc_role: ReplicaRole, cc_role: ReplicaRole) -> ReplicaDescription {
    let mut r = ReplicaDescription::new_in_build(
        NodeInstance::new(node, 1),
        node as i64,
        cc_role,
        SystemTime::now(),
    );
    r.pc_role = pc_role;
    r.state = ReplicaState::Ready;
    r
}

fn phase_reply(msg: &Message, node: NodeId, lsn: i64) -> ReplicaReplyBody {
    let config = match &msg.body {
        MessageBody::GetLSN(c) | MessageBody::Deactivate(c) | MessageBody::Activate(c) => c,
        other => panic!("unexpected {:?}", other),
    };
    let mut replica = member(node, ReplicaRole::None, ReplicaRole::Secondary);
    replica.lsn = lsn;
    ReplicaReplyBody {
        fu: config.fu.clone(),
        replica,
        error: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_drives_reconfiguration() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let mut rx2 = h.net.register(Endpoint::Node(2));
    let mut rx3 = h.net.register(Endpoint::Node(3));
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 1);
    open_primary(&mut h, &body).await?;

    // node 2 stays, node 3 leaves
    let mut fu = body.fu.clone();
    fu.pc_epoch = Epoch::new(1, 1 << 32);
    fu.cc_epoch = fu.pc_epoch.next_configuration();
    let config = ConfigurationMessageBody {
        fu: fu.clone(),
        replicas: vec![
            member(1, ReplicaRole::Primary, ReplicaRole::Primary),
            member(2, ReplicaRole::Secondary, ReplicaRole::Secondary),
            member(3, ReplicaRole::Secondary, ReplicaRole::None),
        ],
        service: body.service.clone(),
    };
    from_fm(&h, MessageBody::DoReconfiguration(config));

    let get_lsn = expect(&mut rx2, |b| matches!(b, MessageBody::GetLSN(_))).await?;
    expect(&mut rx3, |b| matches!(b, MessageBody::GetLSN(_))).await?;
    let stage = h.agent.query_local_replica(&id).map(|fu| fu.reconfiguration_stage);
    assert_eq!(stage, Some(ReconfigurationStage::Phase1GetLsn));
    h.net.send(
        h.agent.endpoint(),
        Message::new(
            Endpoint::Node(2),
            MessageBody::GetLSNReply(phase_reply(&get_lsn, 2, 5)),
        ),
    );

    let deactivate = expect(&mut rx3, |b| matches!(b, MessageBody::Deactivate(_))).await?;
    h.net.send(
        h.agent.endpoint(),
        Message::new(
            Endpoint::Node(3),
            MessageBody::DeactivateReply(phase_reply(&deactivate, 3, 0)),
        ),
    );

    let activate = expect(&mut rx2, |b| matches!(b, MessageBody::Activate(_))).await?;
    h.net.send(
        h.agent.endpoint(),
        Message::new(
            Endpoint::Node(2),
            MessageBody::ActivateReply(phase_reply(&activate, 2, 5)),
        ),
    );

    let done = expect(&mut h.fm_rx, |b| {
        matches!(b, MessageBody::DoReconfigurationReply(_))
    })
    .await?;
    match done.body {
        MessageBody::DoReconfigurationReply(r) => {
            assert!(r.error.is_none());
            assert_eq!(r.fu.cc_epoch, fu.cc_epoch);
            let local = r.replicas.iter().find(|r| r.node.id == 1);
            assert_eq!(local.map(|r| r.lsn), Some(5));
        }
        _ => unreachable!(),
    }
    let local = h
        .agent
        .query_local_replica(&id)
        .ok_or_else(|| FailoverError::msg("unit missing"))?;
    assert!(!local.is_reconfiguring());
    assert!(!local.message_retry.is_set());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn secondary_adopts_activated_role() -> Result<(), FailoverError> {
    let mut h = harness(1).await?;
    ack_node_up(&mut h, Fm).await?;
    let mut rx9 = h.net.register(Endpoint::Node(9));
    let id = FailoverUnitId::new();
    let body = build_body(id, 1, 2);
    from_fm(&h, MessageBody::AddReplica(body.clone()));
    expect(&mut h.fm_rx, |b| matches!(b, MessageBody::AddReplicaReply(_))).await?;

    let mut fu = body.fu.clone();
    fu.cc_epoch = Epoch::new(1, 2 << 32);
    let config = ConfigurationMessageBody {
        fu,
        replicas: vec![
            member(9, ReplicaRole::Primary, ReplicaRole::Primary),
            member(1, ReplicaRole::Idle, ReplicaRole::Secondary),
        ],
        service: body.service,
    };
    h.net.send(
        h.agent.endpoint(),
        Message::new(Endpoint::Node(9), MessageBody::GetLSN(config.clone())),
    );
    let reply = expect(&mut rx9, |b| matches!(b, MessageBody::GetLSNReply(_))).await?;
    assert!(matches!(reply.body, MessageBody::GetLSNReply(r) if r.error.is_none()));

    h.net.send(
        h.agent.endpoint(),
        Message::new(Endpoint::Node(9), MessageBody::Activate(config)),
    );
    expect(&mut rx9, |b| matches!(b, MessageBody::ActivateReply(_))).await?;
    let local = h.agent.query_local_replicas();
    assert_eq!(local[0].role, ReplicaRole::Secondary);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovers_open_replica_after_restart() -> Result<(), FailoverError> {
    let backend: UnitBackend = MemoryStore::new();
    let host = InProcessHost::new();
    let id = FailoverUnitId::new();
    {
        let mut h = harness_on(1, backend.clone(), host.clone()).await?;
        ack_node_up(&mut h, Fm).await?;
        open_primary(&mut h, &build_body(id, 1, 1)).await?;
        host.write(&id, 11)?;
        h.agent.close();
    }

    let mut h = harness_on(1, backend, host.clone()).await?;
    let agent = h.agent.clone();
    wait_until(|| {
        agent
            .query_local_replica(&id)
            .map_or(false, |fu| fu.is_closed && fu.open_pending.is_set())
    })
    .await?;

    // reopened once the FM acknowledges the node
    ack_node_up(&mut h, Fm).await?;
    let agent = h.agent.clone();
    wait_until(|| {
        agent
            .query_local_replica(&id)
            .map_or(false, |fu| !fu.is_closed && !fu.open_pending.is_set())
    })
    .await?;
    let local = h.agent.query_local_replicas();
    assert_eq!(local[0].lsn, 11);
    Ok(())
}
