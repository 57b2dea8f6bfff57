//! Static descriptions of job item kinds.

use std::fmt;

/// When a processed job item gets traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFrequency {
    Always,
    Never,
    OnSuccessfulProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobItemDescription {
    pub name: &'static str,
    pub trace_frequency: TraceFrequency,

    /// If set, a failed commit aborts the process instead of rolling back.
    pub should_fail_fast_on_commit_failure: bool,
}

impl JobItemDescription {
    const fn new(
        name: &'static str,
        trace_frequency: TraceFrequency,
        should_fail_fast_on_commit_failure: bool,
    ) -> Self {
        JobItemDescription {
            name,
            trace_frequency,
            should_fail_fast_on_commit_failure,
        }
    }

    pub const STATE_CLEANUP: JobItemDescription =
        Self::new("StateCleanup", TraceFrequency::Never, false);
    pub const RECONFIGURATION_MESSAGE_RETRY: JobItemDescription = Self::new(
        "ReconfigurationMessageRetry",
        TraceFrequency::OnSuccessfulProcess,
        false,
    );
    pub const REPLICA_CLOSE_MESSAGE_RETRY: JobItemDescription = Self::new(
        "ReplicaCloseMessageRetry",
        TraceFrequency::OnSuccessfulProcess,
        false,
    );
    pub const REPLICA_OPEN_MESSAGE_RETRY: JobItemDescription = Self::new(
        "ReplicaOpenMessageRetry",
        TraceFrequency::OnSuccessfulProcess,
        false,
    );
    pub const UPDATE_SERVICE_DESCRIPTION_MESSAGE_RETRY: JobItemDescription = Self::new(
        "UpdateServiceDescriptionMessageRetry",
        TraceFrequency::OnSuccessfulProcess,
        false,
    );
    pub const CLIENT_REPORT_FAULT: JobItemDescription =
        Self::new("ClientReportFault", TraceFrequency::Always, true);
    pub const NODE_UPDATE_SERVICE: JobItemDescription =
        Self::new("NodeUpdateService", TraceFrequency::Always, true);
    pub const MESSAGE_PROCESSING: JobItemDescription =
        Self::new("MessageProcessing", TraceFrequency::Always, true);
    pub const REPLICA_HOST_REPLY: JobItemDescription =
        Self::new("ReplicaHostReply", TraceFrequency::Always, true);
    pub const NODE_ACTIVATION_CHANGE: JobItemDescription =
        Self::new("NodeActivationChange", TraceFrequency::Always, true);
    pub const NODE_UP_ACK: JobItemDescription =
        Self::new("NodeUpAck", TraceFrequency::Always, true);
    pub const LOCAL_RECOVERY: JobItemDescription =
        Self::new("LocalRecovery", TraceFrequency::Always, true);
    pub const FM_STATE_MACHINE: JobItemDescription =
        Self::new("FMStateMachine", TraceFrequency::Never, false);
    pub const FM_MESSAGE: JobItemDescription =
        Self::new("FMMessage", TraceFrequency::Always, false);
}

impl fmt::Display for JobItemDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Lifecycle of the component a job item runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Open,
    Closing,
    Closed,
}

/// Preconditions checked before a job item's handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobItemCheck {
    /// Component not closed.
    Default,

    /// Component open.
    DefaultAndOpen,

    /// Component not closed and the entity exists.
    FtIsNotNull,

    /// Component open or closing, and the entity exists.
    RaIsOpenOrClosing,
}

impl JobItemCheck {
    pub fn allows_component(&self, state: ComponentState) -> bool {
        match self {
            JobItemCheck::Default | JobItemCheck::FtIsNotNull => {
                state != ComponentState::Closed
            }
            JobItemCheck::DefaultAndOpen => state == ComponentState::Open,
            JobItemCheck::RaIsOpenOrClosing => {
                matches!(state, ComponentState::Open | ComponentState::Closing)
            }
        }
    }

    pub fn requires_entity(&self) -> bool {
        matches!(self, JobItemCheck::FtIsNotNull | JobItemCheck::RaIsOpenOrClosing)
    }
}
