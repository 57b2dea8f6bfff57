//! Per failover manager node activation tracks of an agent.

use std::sync::Arc;

use crate::failover::FailoverManagerId;
use crate::messaging::NodeDeactivationInfo;
use crate::utils::AsyncOperation;

use parking_lot::Mutex;

/// Monitors the closing of replicas after a deactivation; completed once
/// they are all closed, cancelled by a newer activation change.
pub type CloseMonitor = Arc<AsyncOperation<()>>;

/// Activation state of the node as commanded by one failover manager.
#[derive(Debug, Default)]
pub struct NodeActivationState {
    is_activated: bool,
    sequence_number: i64,

    /// The NodeUpAck from this manager has been processed.
    is_ready: bool,

    monitor: Option<CloseMonitor>,
}

impl NodeActivationState {
    fn new() -> Self {
        NodeActivationState {
            is_activated: true,
            ..Default::default()
        }
    }

    fn info(&self) -> NodeDeactivationInfo {
        NodeDeactivationInfo {
            is_activated: self.is_activated,
            sequence_number: self.sequence_number,
        }
    }

    fn cancel_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
    }
}

/// What the agent should do with an activation change message.
#[derive(Debug)]
pub enum ActivationDecision {
    /// Not ready for the sender yet; nothing to do.
    NotReady,

    /// Older than the current state; dropped.
    Stale,

    /// Same as the current state; acknowledge again.
    Duplicate(NodeDeactivationInfo),

    /// Node activated: reply now and reopen replicas.
    Activated(NodeDeactivationInfo),

    /// Node deactivated: close replicas, reply when the monitor completes.
    Deactivated(NodeDeactivationInfo, CloseMonitor),

    /// Duplicate deactivation whose replicas are still closing.
    InProgress,
}

/// Tracks node activation separately for the FM and the FMM.
#[derive(Debug)]
pub struct NodeDeactivationMessageProcessor {
    /// Indexed by `is_fmm`.
    tracks: Mutex<[NodeActivationState; 2]>,
}

impl Default for NodeDeactivationMessageProcessor {
    fn default() -> Self {
        NodeDeactivationMessageProcessor {
            tracks: Mutex::new([NodeActivationState::new(), NodeActivationState::new()]),
        }
    }
}

fn index(owner: FailoverManagerId) -> usize {
    owner.is_fmm() as usize
}

impl NodeDeactivationMessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a change to one track if `sequence_number` is newer than
    /// the track's current one.
    pub fn try_change_activation_status(
        &self,
        is_fmm: bool,
        is_activated: bool,
        sequence_number: i64,
    ) -> bool {
        let mut tracks = self.tracks.lock();
        let track = &mut tracks[is_fmm as usize];
        if sequence_number <= track.sequence_number {
            return false;
        }
        track.is_activated = is_activated;
        track.sequence_number = sequence_number;
        true
    }

    pub fn is_activated(&self, owner: FailoverManagerId) -> bool {
        self.tracks.lock()[index(owner)].is_activated
    }

    pub fn activation_info(&self, owner: FailoverManagerId) -> NodeDeactivationInfo {
        self.tracks.lock()[index(owner)].info()
    }

    pub fn is_ready(&self, owner: FailoverManagerId) -> bool {
        self.tracks.lock()[index(owner)].is_ready
    }

    /// Processes the NodeUpAck of `owner`: adopts its activation state and
    /// marks the track ready.
    pub fn on_node_up_ack(&self, owner: FailoverManagerId, info: NodeDeactivationInfo) {
        self.try_change_activation_status(
            owner.is_fmm(),
            info.is_activated,
            info.sequence_number,
        );
        self.tracks.lock()[index(owner)].is_ready = true;
    }

    /// Processes an ActivateNode. An accepted activation applies to both
    /// tracks and cancels their close monitors.
    pub fn process_activate(
        &self,
        sender: FailoverManagerId,
        info: NodeDeactivationInfo,
    ) -> ActivationDecision {
        let mut tracks = self.tracks.lock();
        if !tracks[index(sender)].is_ready {
            return ActivationDecision::NotReady;
        }
        let current = tracks[index(sender)].info();
        if info.sequence_number < current.sequence_number {
            return ActivationDecision::Stale;
        }
        if info.sequence_number == current.sequence_number {
            return if current.is_activated {
                ActivationDecision::Duplicate(current)
            } else {
                ActivationDecision::Stale
            };
        }

        for track in tracks.iter_mut() {
            if info.sequence_number > track.sequence_number {
                track.is_activated = true;
                track.sequence_number = info.sequence_number;
                track.cancel_monitor();
            }
        }
        ActivationDecision::Activated(tracks[index(sender)].info())
    }

    /// Processes a DeactivateNode. Only the sender's track changes; a new
    /// close monitor replaces any running one.
    pub fn process_deactivate(
        &self,
        sender: FailoverManagerId,
        info: NodeDeactivationInfo,
    ) -> ActivationDecision {
        let mut tracks = self.tracks.lock();
        let track = &mut tracks[index(sender)];
        if !track.is_ready {
            return ActivationDecision::NotReady;
        }
        if info.sequence_number < track.sequence_number {
            return ActivationDecision::Stale;
        }
        if info.sequence_number == track.sequence_number {
            if track.is_activated {
                return ActivationDecision::Stale;
            }
            return match &track.monitor {
                Some(monitor) if !monitor.is_done() => ActivationDecision::InProgress,
                _ => ActivationDecision::Duplicate(track.info()),
            };
        }

        track.is_activated = false;
        track.sequence_number = info.sequence_number;
        track.cancel_monitor();
        let monitor: CloseMonitor = Arc::new(AsyncOperation::new());
        track.monitor = Some(monitor.clone());
        ActivationDecision::Deactivated(track.info(), monitor)
    }

    /// Cancels every close monitor.
    pub fn close(&self) {
        for track in self.tracks.lock().iter_mut() {
            track.cancel_monitor();
        }
    }
}

#[cfg(test)]
mod deactivation_tests {
    use super::*;
    use FailoverManagerId::{Fm, Fmm};

    fn info(is_activated: bool, sequence_number: i64) -> NodeDeactivationInfo {
        NodeDeactivationInfo {
            is_activated,
            sequence_number,
        }
    }

    fn ready() -> NodeDeactivationMessageProcessor {
        let processor = NodeDeactivationMessageProcessor::new();
        processor.on_node_up_ack(Fm, info(true, 0));
        processor.on_node_up_ack(Fmm, info(true, 0));
        processor
    }

    #[test]
    fn sequence_numbers_monotonic() {
        let processor = NodeDeactivationMessageProcessor::new();
        assert!(processor.try_change_activation_status(false, false, 5));
        assert!(!processor.try_change_activation_status(false, true, 5));
        assert!(!processor.try_change_activation_status(false, true, 3));
        assert!(!processor.is_activated(Fm));
        assert!(processor.try_change_activation_status(false, true, 6));
        assert!(processor.is_activated(Fm));
        // tracks are independent
        assert!(processor.try_change_activation_status(true, false, 1));
        assert!(processor.is_activated(Fm));
        assert!(!processor.is_activated(Fmm));
    }

    #[test]
    fn ignored_until_ready() {
        let processor = NodeDeactivationMessageProcessor::new();
        assert!(matches!(
            processor.process_deactivate(Fm, info(false, 1)),
            ActivationDecision::NotReady
        ));
        processor.on_node_up_ack(Fm, info(false, 4));
        assert!(!processor.is_activated(Fm));
        assert!(processor.is_ready(Fm));
        assert!(!processor.is_ready(Fmm));
    }

    #[test]
    fn activation_mirrored_and_cancels_monitor() {
        let processor = ready();
        let monitor = match processor.process_deactivate(Fm, info(false, 2)) {
            ActivationDecision::Deactivated(_, monitor) => monitor,
            other => panic!("unexpected {:?}", other),
        };
        assert!(!processor.is_activated(Fm));
        assert!(processor.is_activated(Fmm));
        assert!(matches!(
            processor.process_deactivate(Fm, info(false, 2)),
            ActivationDecision::InProgress
        ));

        assert!(matches!(
            processor.process_activate(Fm, info(true, 3)),
            ActivationDecision::Activated(_)
        ));
        assert!(monitor.is_cancelled());
        assert_eq!(processor.activation_info(Fm), info(true, 3));
        assert_eq!(processor.activation_info(Fmm), info(true, 3));
        assert!(matches!(
            processor.process_deactivate(Fm, info(false, 2)),
            ActivationDecision::Stale
        ));
        assert!(matches!(
            processor.process_activate(Fm, info(true, 3)),
            ActivationDecision::Duplicate(_)
        ));
    }

    #[test]
    fn completed_deactivation_acked_again() {
        let processor = ready();
        let monitor = match processor.process_deactivate(Fmm, info(false, 1)) {
            ActivationDecision::Deactivated(_, monitor) => monitor,
            other => panic!("unexpected {:?}", other),
        };
        assert!(monitor.try_complete(()));
        assert!(matches!(
            processor.process_deactivate(Fmm, info(false, 1)),
            ActivationDecision::Duplicate(_)
        ));
        processor.close();
        assert!(!monitor.is_cancelled());
    }
}
