//! Request/reply pipeline that resends a request until its reply arrives,
//! it is cancelled, or a newer request supersedes it. All bookkeeping sits
//! behind one lock, so admission and supersession are ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::messaging::{Endpoint, Message, MessageTransport};
use crate::utils::{AsyncOperation, FailoverError, OperationOutcome, Timer};

use parking_lot::Mutex;

use tokio::time::Duration;

type RequestOp = AsyncOperation<Result<Message, FailoverError>>;

/// Upper bound factor on the retry interval backoff.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Handle of one in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    request_id: u64,
    op: Arc<RequestOp>,
}

impl PendingRequest {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_done(&self) -> bool {
        self.op.is_done()
    }

    /// Cancels the request. Idempotent; a no-op once the reply is in.
    pub fn cancel(&self) -> bool {
        self.op.cancel()
    }

    /// Waits for the reply. Fails with `Stale` if a newer request replaced
    /// this one, `Closed` if cancelled or the pipeline closed.
    pub async fn end(self) -> Result<Message, FailoverError> {
        match self.op.wait().await {
            OperationOutcome::Completed(result) => result,
            OperationOutcome::Cancelled => Err(FailoverError::Closed(format!(
                "request {} cancelled",
                self.request_id
            ))),
        }
    }
}

/// Names the request stream a request belongs to. Within one key a
/// request replaces the in-flight one unless it carries a lower sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeKey {
    pub key: String,
    pub sequence: i64,
}

impl SupersedeKey {
    pub fn new(key: impl Into<String>, sequence: i64) -> Self {
        SupersedeKey {
            key: key.into(),
            sequence,
        }
    }
}

struct PipelineState {
    /// Map from request ID -> in-flight request.
    in_flight: HashMap<u64, Arc<RequestOp>>,

    /// Map from supersede key -> (sequence, request ID) of the newest
    /// request begun with it. Kept after that request ends.
    latest: HashMap<String, (i64, u64)>,

    closed: bool,
}

enum Admission {
    Closed,
    Outdated { newer_id: u64, newer_sequence: i64 },
    Admitted { superseded: Option<(u64, Arc<RequestOp>)> },
}

/// Retrying request sender.
pub struct MessageRetryPipeline {
    /// Owner identity used as logging prefix.
    me: String,

    /// Sender identity stamped on requests.
    from: Endpoint,

    transport: Arc<dyn MessageTransport>,

    next_request_id: AtomicU64,

    state: Mutex<PipelineState>,
}

impl MessageRetryPipeline {
    pub fn new(
        me: impl Into<String>,
        from: Endpoint,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        Arc::new(MessageRetryPipeline {
            me: me.into(),
            from,
            transport,
            next_request_id: AtomicU64::new(1),
            state: Mutex::new(PipelineState {
                in_flight: HashMap::new(),
                latest: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Sends `message` to `destination` now and again after every retry
    /// interval (backing off up to 8x) until the request ends. A request
    /// whose `supersede_key` matches an earlier one with an equal or lower
    /// sequence replaces it, and the earlier request ends with `Stale`. A
    /// request older than the newest one for its key ends with `Stale`
    /// right away and is never sent.
    pub fn begin_request(
        self: &Arc<Self>,
        mut message: Message,
        destination: Endpoint,
        retry_interval: Duration,
        supersede_key: Option<SupersedeKey>,
    ) -> PendingRequest {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        message.request_id = request_id;
        message.from = self.from;
        let op = Arc::new(RequestOp::new());

        let admission = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let newest = supersede_key
                .as_ref()
                .and_then(|sk| state.latest.get(&sk.key).copied());
            match (&supersede_key, newest) {
                _ if state.closed => Admission::Closed,
                (Some(sk), Some((newer_sequence, newer_id))) if newer_sequence > sk.sequence => {
                    Admission::Outdated {
                        newer_id,
                        newer_sequence,
                    }
                }
                (key, _) => {
                    let mut superseded = None;
                    if let Some(sk) = key {
                        let older = state
                            .latest
                            .insert(sk.key.clone(), (sk.sequence, request_id));
                        if let Some((_, older_id)) = older {
                            superseded = state
                                .in_flight
                                .remove(&older_id)
                                .map(|older| (older_id, older));
                        }
                    }
                    state.in_flight.insert(request_id, op.clone());
                    Admission::Admitted { superseded }
                }
            }
        };

        match admission {
            Admission::Closed => {
                op.try_complete(Err(FailoverError::Closed(
                    "retry pipeline closed".into(),
                )));
                return PendingRequest { request_id, op };
            }
            Admission::Outdated {
                newer_id,
                newer_sequence,
            } => {
                pf_debug!(self.me; "request {} outdated by {} (seq {})",
                                   request_id, newer_id, newer_sequence);
                op.try_complete(Err(FailoverError::Stale(format!(
                    "request {} outdated by {} with seq {}",
                    request_id, newer_id, newer_sequence
                ))));
                return PendingRequest { request_id, op };
            }
            Admission::Admitted {
                superseded: Some((older_id, older)),
            } => {
                pf_debug!(self.me; "request {} superseded by {}",
                                   older_id, request_id);
                older.try_complete(Err(FailoverError::Stale(format!(
                    "request {} superseded by {}",
                    older_id, request_id
                ))));
            }
            Admission::Admitted { superseded: None } => {}
        }

        let pipeline = self.clone();
        let op_ref = op.clone();
        tokio::spawn(async move {
            pipeline
                .retry_loop(request_id, message, destination, retry_interval, op_ref)
                .await;
        });

        PendingRequest { request_id, op }
    }

    async fn retry_loop(
        &self,
        request_id: u64,
        message: Message,
        destination: Endpoint,
        retry_interval: Duration,
        op: Arc<RequestOp>,
    ) {
        let mut timer = Timer::with_backoff(
            retry_interval,
            2,
            retry_interval * MAX_BACKOFF_FACTOR,
        );
        let mut attempts = 0u32;
        if let Err(e) = timer.kickoff() {
            op.try_complete(Err(e));
        }

        while !op.is_done() {
            attempts += 1;
            if attempts > 1 {
                pf_trace!(self.me; "resending {} to {} (attempt {})",
                                   message, destination, attempts);
            }
            self.transport.send(destination, message.clone());

            tokio::select! {
                _ = op.wait() => break,
                _ = timer.timeout() => {
                    if let Err(e) = timer.backoff() {
                        op.try_complete(Err(e));
                    }
                }
            }
        }

        self.forget(request_id, &op);
    }

    // removes bookkeeping only if it still refers to this very request
    fn forget(&self, request_id: u64, op: &Arc<RequestOp>) {
        let mut state = self.state.lock();
        if matches!(state.in_flight.get(&request_id), Some(f) if Arc::ptr_eq(f, op)) {
            state.in_flight.remove(&request_id);
        }
    }

    /// Delivers a reply. Returns false if no request with that ID is in
    /// flight (late or duplicate reply).
    pub fn on_reply(&self, request_id: u64, message: Message) -> bool {
        let op = match self.state.lock().in_flight.get(&request_id) {
            Some(op) => op.clone(),
            None => {
                pf_debug!(self.me; "no request {} for {}", request_id, message);
                return false;
            }
        };
        op.try_complete(Ok(message))
    }

    /// Number of requests still awaiting replies.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Ends every in-flight request with `Closed` and rejects new ones.
    pub fn close(&self) {
        let drained: Vec<Arc<RequestOp>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.latest.clear();
            state.in_flight.drain().map(|(_, op)| op).collect()
        };
        for op in drained {
            op.try_complete(Err(FailoverError::Closed(
                "retry pipeline closed".into(),
            )));
        }
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;
    use crate::failover::FailoverManagerId;
    use crate::messaging::{InMemoryNetwork, MessageBody, NodeDeactivationInfo};
    use tokio::time::{self, Instant};

    fn deactivate(seq: i64) -> Message {
        Message::new(
            Endpoint::Manager(FailoverManagerId::Fm),
            MessageBody::DeactivateNode(NodeDeactivationInfo {
                is_activated: false,
                sequence_number: seq,
            }),
        )
    }

    fn setup() -> (Arc<InMemoryNetwork>, Arc<MessageRetryPipeline>) {
        let net = InMemoryNetwork::new();
        let pipeline = MessageRetryPipeline::new(
            "fm",
            Endpoint::Manager(FailoverManagerId::Fm),
            net.clone(),
        );
        (net, pipeline)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resends_until_reply() -> Result<(), FailoverError> {
        let (net, pipeline) = setup();
        let mut rx = net.register(Endpoint::Node(1));
        let req = pipeline.begin_request(
            deactivate(1),
            Endpoint::Node(1),
            Duration::from_millis(20),
            None,
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.request_id, req.request_id());
        assert_eq!(second.request_id, req.request_id());

        let reply = first.reply(
            Endpoint::Node(1),
            MessageBody::DeactivateNodeReply(NodeDeactivationInfo {
                is_activated: false,
                sequence_number: 1,
            }),
        );
        assert!(pipeline.on_reply(reply.request_id, reply.clone()));
        assert_eq!(req.end().await?, reply);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.in_flight_count(), 0);
        assert!(!pipeline.on_reply(reply.request_id, reply));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_request_supersedes() -> Result<(), FailoverError> {
        let (_net, pipeline) = setup();
        let key = Some(SupersedeKey::new("node-1", 1));
        let old = pipeline.begin_request(
            deactivate(1),
            Endpoint::Node(1),
            Duration::from_millis(20),
            key.clone(),
        );
        let new = pipeline.begin_request(
            deactivate(2),
            Endpoint::Node(1),
            Duration::from_millis(20),
            Some(SupersedeKey::new("node-1", 2)),
        );
        assert!(matches!(old.end().await, Err(FailoverError::Stale(_))));
        assert!(!new.is_done());
        assert!(new.cancel());
        assert!(matches!(new.end().await, Err(FailoverError::Closed(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn older_sequence_does_not_supersede() -> Result<(), FailoverError> {
        let (net, pipeline) = setup();
        let mut rx = net.register(Endpoint::Node(1));
        let newer = pipeline.begin_request(
            deactivate(3),
            Endpoint::Node(1),
            Duration::from_millis(20),
            Some(SupersedeKey::new("node-1", 3)),
        );
        let older = pipeline.begin_request(
            deactivate(2),
            Endpoint::Node(1),
            Duration::from_millis(20),
            Some(SupersedeKey::new("node-1", 2)),
        );
        assert!(matches!(older.end().await, Err(FailoverError::Stale(_))));
        assert!(!newer.is_done());
        assert_eq!(pipeline.in_flight_count(), 1);

        // only the newer request keeps going out
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.request_id, newer.request_id());
            assert!(matches!(
                msg.body,
                MessageBody::DeactivateNode(NodeDeactivationInfo {
                    sequence_number: 3,
                    ..
                })
            ));
        }

        // still refused once the newer request has ended
        assert!(newer.cancel());
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.in_flight_count(), 0);
        let late = pipeline.begin_request(
            deactivate(1),
            Endpoint::Node(1),
            Duration::from_millis(20),
            Some(SupersedeKey::new("node-1", 1)),
        );
        assert!(matches!(late.end().await, Err(FailoverError::Stale(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backoff_spaces_out_resends() -> Result<(), FailoverError> {
        let (net, pipeline) = setup();
        let mut rx = net.register(Endpoint::Node(1));
        let start = Instant::now();
        let _req = pipeline.begin_request(
            deactivate(1),
            Endpoint::Node(1),
            Duration::from_millis(20),
            None,
        );
        // sends at ~0, ~20, ~60, ~140 ms
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(140));
        pipeline.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_ends_requests() -> Result<(), FailoverError> {
        let (_net, pipeline) = setup();
        let req = pipeline.begin_request(
            deactivate(1),
            Endpoint::Node(1),
            Duration::from_millis(20),
            None,
        );
        pipeline.close();
        assert!(matches!(req.end().await, Err(FailoverError::Closed(_))));
        let late = pipeline.begin_request(
            deactivate(2),
            Endpoint::Node(1),
            Duration::from_millis(20),
            None,
        );
        assert!(late.is_done());
        Ok(())
    }
}
