//! Entity sets, retry timers, and the background work managers that drain
//! them.

mod entity_set;
mod multi_work;
mod retry_timer;
mod work_manager;

pub use entity_set::{
    ChangeSetMembershipAction, EntitySet, EntitySetCollection, EntitySetName,
    SetMembershipFlag, SetSizeGauge,
};
pub use multi_work::{EntityJobFactory, MultipleEntityBackgroundWorkManager};
pub use retry_timer::{IntervalSource, RetryTimer, TimerCallback};
pub use work_manager::{
    BackgroundWorkManagerWithRetry, RetryRequest, WorkCallback, WorkState,
};
