//! Coalescing background work dispatcher with timer-driven retry.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::background::{IntervalSource, RetryTimer};

use futures::future::BoxFuture;

use parking_lot::Mutex;

use tokio::time::{self, Instant};

/// What a finished work cycle asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRequest {
    /// Done; disarm the retry timer unless it was re-armed meanwhile.
    None,

    /// Run again after the retry interval.
    Timer,

    /// Run again right away.
    Immediate,
}

impl From<bool> for RetryRequest {
    fn from(retry: bool) -> Self {
        if retry {
            RetryRequest::Timer
        } else {
            RetryRequest::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Idle,
    Pending,
    Running,
}

/// One work cycle; resolves to the retry it wants.
pub type WorkCallback = Box<dyn Fn() -> BoxFuture<'static, RetryRequest> + Send + Sync>;

struct WorkStatus {
    state: WorkState,

    /// A request arrived while running.
    rerun: bool,

    /// Start of the last cycle, for throttling.
    last_start: Option<Instant>,

    closed: bool,
}

/// Runs a work callback on demand with at most one cycle dispatched at a
/// time. Requests made while Pending or Running coalesce into at most one
/// more cycle.
pub struct BackgroundWorkManagerWithRetry {
    name: String,
    callback: WorkCallback,
    retry_timer: Arc<RetryTimer>,
    min_interval: IntervalSource,
    status: Mutex<WorkStatus>,
}

impl fmt::Debug for BackgroundWorkManagerWithRetry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BackgroundWork({}, {:?})", self.name, self.state())
    }
}

impl BackgroundWorkManagerWithRetry {
    /// Creates the manager. `retry_interval` and `min_interval` are read
    /// again on every use so configuration reloads take effect.
    pub fn new(
        name: impl Into<String>,
        callback: WorkCallback,
        retry_interval: IntervalSource,
        min_interval: IntervalSource,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            let retry_timer = RetryTimer::new(
                name.clone(),
                retry_interval,
                Box::new(move |_| {
                    if let Some(manager) = me.upgrade() {
                        manager.request();
                    }
                }),
            );
            BackgroundWorkManagerWithRetry {
                name,
                callback,
                retry_timer,
                min_interval,
                status: Mutex::new(WorkStatus {
                    state: WorkState::Idle,
                    rerun: false,
                    last_start: None,
                    closed: false,
                }),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkState {
        self.status.lock().state
    }

    pub fn retry_timer(&self) -> &Arc<RetryTimer> {
        &self.retry_timer
    }

    /// Requests a work cycle. Dispatches only from Idle.
    pub fn request(self: &Arc<Self>) {
        let dispatch = {
            let mut status = self.status.lock();
            if status.closed {
                return;
            }
            match status.state {
                WorkState::Idle => {
                    status.state = WorkState::Pending;
                    true
                }
                WorkState::Pending => false,
                WorkState::Running => {
                    status.rerun = true;
                    false
                }
            }
        };
        if dispatch {
            self.dispatch();
        }
    }

    /// Arms the retry timer; on fire it behaves like `request()`.
    pub fn set_timer(&self) {
        self.retry_timer.set();
    }

    fn dispatch(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let wait = {
                let status = manager.status.lock();
                let min_interval = (manager.min_interval)();
                status
                    .last_start
                    .map(|t| min_interval.saturating_sub(t.elapsed()))
            };
            if let Some(wait) = wait.filter(|w| !w.is_zero()) {
                time::sleep(wait).await;
            }

            let seq = {
                let mut status = manager.status.lock();
                if status.closed {
                    status.state = WorkState::Idle;
                    return;
                }
                status.state = WorkState::Running;
                status.rerun = false;
                status.last_start = Some(Instant::now());
                manager.retry_timer.sequence()
            };

            let retry = (manager.callback)().await;
            manager.on_work_complete(seq, retry);
        });
    }

    /// Ends the cycle that started when the timer sequence was `seq`.
    fn on_work_complete(self: &Arc<Self>, seq: u64, retry: RetryRequest) {
        match retry {
            // a set_timer() during the cycle bumped the sequence, so this
            // cannot disarm it
            RetryRequest::None => {
                self.retry_timer.try_cancel(seq);
            }
            RetryRequest::Timer => {
                self.retry_timer.set();
            }
            RetryRequest::Immediate => {}
        }

        let redispatch = {
            let mut status = self.status.lock();
            if status.closed {
                status.state = WorkState::Idle;
                return;
            }
            if retry == RetryRequest::Immediate || status.rerun {
                status.state = WorkState::Pending;
                status.rerun = false;
                true
            } else {
                status.state = WorkState::Idle;
                false
            }
        };
        if redispatch {
            self.dispatch();
        }
    }

    /// Stops the timer and rejects further requests.
    pub fn close(&self) {
        self.status.lock().closed = true;
        self.retry_timer.close();
    }
}
