//! Replica host: where local replicas are actually opened and closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::failover::{FailoverUnitId, ReplicaId};
use crate::utils::FailoverError;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

use tokio::time::{self, Duration};

/// Why a local replica is being closed; decides what happens once the
/// close completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaCloseMode {
    /// Plain close, no follow-up.
    Close,

    /// Close and reopen the replica.
    Restart,

    /// Leaving the configuration; reply to the reconfiguring primary.
    Deactivate,

    /// Node deactivated by its FM; reopen if the node gets activated.
    DeactivateNode,

    /// Deleted by the FM; reply to the FM.
    Delete,

    /// Forced delete; a host failure does not stop it.
    Obliterate,
}

impl ReplicaCloseMode {
    pub fn is_delete(&self) -> bool {
        matches!(self, ReplicaCloseMode::Delete | ReplicaCloseMode::Obliterate)
    }

    /// Does the replica lose its state with this close?
    pub fn is_drop(&self) -> bool {
        self.is_delete()
            || matches!(self, ReplicaCloseMode::Close | ReplicaCloseMode::Deactivate)
    }
}

impl fmt::Display for ReplicaCloseMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostRequestKind {
    Open,
    Close(ReplicaCloseMode),
    UpdateServiceDescription,
}

/// A request to the replica host about one local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRequest {
    pub failover_unit_id: FailoverUnitId,
    pub replica_id: ReplicaId,
    pub kind: HostRequestKind,
}

impl fmt::Display for HostRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} {}#{}", self.kind, self.failover_unit_id, self.replica_id)
    }
}

/// Replica host running replicas inside this process. Open and close
/// complete after a configurable delay and can be made to fail.
#[derive(Debug, Default)]
pub struct InProcessHost {
    delay_ms: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_closes: AtomicUsize,

    /// Open replicas and their last sequence number.
    replicas: Mutex<HashMap<FailoverUnitId, (ReplicaId, i64)>>,
}

impl InProcessHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Makes the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` closes fail.
    pub fn fail_next_closes(&self, n: usize) {
        self.fail_closes.store(n, Ordering::SeqCst);
    }

    pub fn is_open(&self, id: &FailoverUnitId) -> bool {
        self.replicas.lock().contains_key(id)
    }

    pub fn open_count(&self) -> usize {
        self.replicas.lock().len()
    }

    /// Advances the sequence number of an open replica, as writes would.
    pub fn write(&self, id: &FailoverUnitId, count: i64) -> Result<i64, FailoverError> {
        match self.replicas.lock().get_mut(id) {
            Some((_, lsn)) => {
                *lsn += count;
                Ok(*lsn)
            }
            None => Err(FailoverError::NotFound(format!("replica {}", id))),
        }
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn perform(&self, request: &HostRequest) -> Result<i64, FailoverError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let id = request.failover_unit_id;
        match request.kind {
            HostRequestKind::Open => {
                if Self::take_injected(&self.fail_opens) {
                    return Err(FailoverError::msg(format!("injected open failure of {}", id)));
                }
                let mut replicas = self.replicas.lock();
                let entry = replicas.entry(id).or_insert((request.replica_id, 0));
                if entry.0 != request.replica_id {
                    // a new replica of the partition starts from scratch
                    *entry = (request.replica_id, 0);
                }
                Ok(entry.1)
            }

            HostRequestKind::Close(mode) => {
                if mode != ReplicaCloseMode::Obliterate
                    && Self::take_injected(&self.fail_closes)
                {
                    return Err(FailoverError::msg(format!("injected close failure of {}", id)));
                }
                let mut replicas = self.replicas.lock();
                let lsn = replicas.get(&id).map_or(0, |(_, lsn)| *lsn);
                if mode.is_drop() {
                    replicas.remove(&id);
                } else if let Some(entry) = replicas.get_mut(&id) {
                    // closed but keeps its data for a reopen
                    entry.0 = request.replica_id;
                }
                Ok(lsn)
            }

            HostRequestKind::UpdateServiceDescription => {
                Ok(self.replicas.lock().get(&id).map_or(0, |(_, lsn)| *lsn))
            }
        }
    }
}

/// The replica host an agent talks to.
#[derive(Debug, Clone)]
pub enum ReplicaHost {
    /// Replicas hosted in this process.
    InProcess(Arc<InProcessHost>),

    /// Nothing to activate: every request completes immediately and no
    /// host message is sent.
    NonActivated,
}

impl ReplicaHost {
    /// Requests on this host complete inside the transition that makes
    /// them.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, ReplicaHost::NonActivated)
    }

    /// Carries out a request; returns the replica's sequence number.
    pub async fn perform(&self, request: &HostRequest) -> Result<i64, FailoverError> {
        match self {
            ReplicaHost::InProcess(host) => host.perform(request).await,
            ReplicaHost::NonActivated => Ok(0),
        }
    }
}

#[cfg(test)]
mod host_tests {
    use super::*;

    fn request(id: FailoverUnitId, kind: HostRequestKind) -> HostRequest {
        HostRequest {
            failover_unit_id: id,
            replica_id: 1,
            kind,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_keeps_data() -> Result<(), FailoverError> {
        let host = InProcessHost::new();
        let id = FailoverUnitId::new();
        assert_eq!(host.perform(&request(id, HostRequestKind::Open)).await?, 0);
        assert_eq!(host.write(&id, 7)?, 7);
        let restart = HostRequestKind::Close(ReplicaCloseMode::Restart);
        assert_eq!(host.perform(&request(id, restart)).await?, 7);
        assert_eq!(host.perform(&request(id, HostRequestKind::Open)).await?, 7);

        let delete = HostRequestKind::Close(ReplicaCloseMode::Delete);
        host.perform(&request(id, delete)).await?;
        assert!(!host.is_open(&id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn obliterate_ignores_injected_failure() -> Result<(), FailoverError> {
        let host = InProcessHost::new();
        let id = FailoverUnitId::new();
        host.fail_next_opens(1);
        assert!(host.perform(&request(id, HostRequestKind::Open)).await.is_err());
        host.perform(&request(id, HostRequestKind::Open)).await?;

        host.fail_next_closes(1);
        let obliterate = HostRequestKind::Close(ReplicaCloseMode::Obliterate);
        host.perform(&request(id, obliterate)).await?;
        assert_eq!(host.open_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_activated_completes() -> Result<(), FailoverError> {
        let host = ReplicaHost::NonActivated;
        assert!(host.is_synchronous());
        let req = request(FailoverUnitId::new(), HostRequestKind::Open);
        assert_eq!(host.perform(&req).await?, 0);
        Ok(())
    }
}
