//! Job items, the per-key job queue, and state machine actions.

mod actions;
mod description;
mod handler;
mod queue;

pub use actions::{ActionExecutor, ActionQueue, StateMachineAction};
pub use description::{ComponentState, JobItemCheck, JobItemDescription, TraceFrequency};
pub use handler::{run_state_machine_job, JobOutcome};
pub use queue::{
    AbortOnFailFast, FailFastHandler, JobCompletion, JobItem, JobQueueManager,
    RecordingFailFast,
};
