//! Per-key serialized job queue: items for one key run one at a time in
//! enqueue order, items for different keys run in parallel.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::jobs::{JobItemDescription, TraceFrequency};
use crate::utils::FailoverError;

use futures::future::BoxFuture;
use futures::FutureExt;

use parking_lot::Mutex;

use tokio::sync::oneshot;

/// One unit of serialized work.
pub struct JobItem {
    description: JobItemDescription,
    work: BoxFuture<'static, Result<(), FailoverError>>,
}

impl fmt::Debug for JobItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "JobItem({})", self.description)
    }
}

impl JobItem {
    pub fn new<F>(description: JobItemDescription, work: F) -> Self
    where
        F: Future<Output = Result<(), FailoverError>> + Send + 'static,
    {
        JobItem {
            description,
            work: work.boxed(),
        }
    }

    pub fn description(&self) -> &JobItemDescription {
        &self.description
    }
}

/// Resolves with the outcome of an enqueued job item.
#[derive(Debug)]
pub struct JobCompletion {
    rx: oneshot::Receiver<Result<(), FailoverError>>,
}

impl JobCompletion {
    pub async fn wait(self) -> Result<(), FailoverError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FailoverError::Closed("job item dropped".into())),
        }
    }
}

/// Reaction to a failed commit of a fail-fast job item.
pub trait FailFastHandler: Send + Sync {
    fn fail_fast(&self, job: &JobItemDescription, error: &FailoverError);
}

/// Aborts the process: in-memory state may have diverged from storage.
#[derive(Debug, Default)]
pub struct AbortOnFailFast;

impl FailFastHandler for AbortOnFailFast {
    fn fail_fast(&self, job: &JobItemDescription, error: &FailoverError) {
        pf_error!("jobs"; "fail-fast: commit of {} failed: {}", job, error);
        std::process::abort();
    }
}

/// Records fail-fast events instead of aborting.
#[derive(Debug, Default)]
pub struct RecordingFailFast {
    events: Mutex<Vec<(String, FailoverError)>>,
}

impl RecordingFailFast {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, FailoverError)> {
        self.events.lock().clone()
    }
}

impl FailFastHandler for RecordingFailFast {
    fn fail_fast(&self, job: &JobItemDescription, error: &FailoverError) {
        pf_error!("jobs"; "fail-fast: commit of {} failed: {}", job, error);
        self.events.lock().push((job.name.to_string(), error.clone()));
    }
}

struct QueuedJob {
    item: JobItem,
    tx: oneshot::Sender<Result<(), FailoverError>>,
}

struct QueueState<K> {
    /// A key is present iff a drain task owns it; its deque holds the items
    /// still waiting behind the running one.
    queues: HashMap<K, VecDeque<QueuedJob>>,
    closed: bool,
}

/// Serializes job items per key on the tokio runtime.
pub struct JobQueueManager<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    fail_fast: Arc<dyn FailFastHandler>,
    processed: AtomicU64,
}

impl<K> fmt::Debug for JobQueueManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "JobQueueManager({})", self.name)
    }
}

impl<K> JobQueueManager<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, fail_fast: Arc<dyn FailFastHandler>) -> Arc<Self> {
        Arc::new(JobQueueManager {
            name: name.into(),
            state: Mutex::new(QueueState {
                queues: HashMap::new(),
                closed: false,
            }),
            fail_fast,
            processed: AtomicU64::new(0),
        })
    }

    /// Appends `item` to the queue of `key`. Only the enqueuer that finds
    /// the key idle spawns a drain task for it.
    pub fn enqueue(self: &Arc<Self>, key: K, item: JobItem) -> JobCompletion {
        let (tx, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.state.lock();
            if state.closed {
                let _ = tx.send(Err(FailoverError::Closed(format!(
                    "{} closed, rejecting {}",
                    self.name, item.description
                ))));
                return JobCompletion { rx };
            }

            let job = QueuedJob { item, tx };
            match state.queues.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(job);
                    false
                }
                None => {
                    state.queues.insert(key.clone(), VecDeque::from([job]));
                    true
                }
            }
        };

        if start_drain {
            let manager = self.clone();
            tokio::spawn(async move { manager.drain(key).await });
        }
        JobCompletion { rx }
    }

    async fn drain(self: Arc<Self>, key: K) {
        loop {
            let job = {
                let mut state = self.state.lock();
                match state.queues.get_mut(&key).and_then(|q| q.pop_front()) {
                    Some(job) => job,
                    None => {
                        state.queues.remove(&key);
                        return;
                    }
                }
            };

            let description = job.item.description;
            // inner task so a panicking handler cannot wedge the key
            let result = match tokio::spawn(job.item.work).await {
                Ok(result) => result,
                Err(e) => Err(FailoverError::from(e)),
            };
            self.processed.fetch_add(1, Ordering::Relaxed);

            match &result {
                Ok(()) => {
                    if description.trace_frequency != TraceFrequency::Never {
                        pf_trace!(self.name; "processed {} for {:?}", description, key);
                    }
                }
                Err(e) => {
                    if description.trace_frequency == TraceFrequency::Always {
                        pf_debug!(self.name; "{} for {:?} failed: {}", description, key, e);
                    }
                    if let FailoverError::CommitFailed(_) = e {
                        if description.should_fail_fast_on_commit_failure {
                            self.fail_fast.fail_fast(&description, e);
                        }
                    }
                }
            }
            let _ = job.tx.send(result);
        }
    }

    /// Number of keys with a job running or queued.
    pub fn active_keys(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Number of items waiting behind running ones.
    pub fn queued_count(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Rejects new items and fails queued ones with `Closed`. Items already
    /// running finish normally.
    pub fn close(&self) {
        let drained: Vec<QueuedJob> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.queues.values_mut().flat_map(|q| q.drain(..)).collect()
        };
        pf_debug!(self.name; "closing, failing {} queued items", drained.len());
        for job in drained {
            let _ = job.tx.send(Err(FailoverError::Closed(format!(
                "{} closed before {} ran",
                self.name, job.item.description
            ))));
        }
    }
}
