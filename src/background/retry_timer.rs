//! Single-shot rearming retry timer with sequence-numbered arm/disarm.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Callback invoked when the timer fires, with the sequence number of the
/// arm that fired.
pub type TimerCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Source of the current retry interval, read on every arm.
pub type IntervalSource = Box<dyn Fn() -> Duration + Send + Sync>;

struct TimerState {
    /// Bumped on every `set()`.
    sequence: u64,

    is_set: bool,

    /// Sleeper task of the current arm.
    handle: Option<JoinHandle<()>>,

    closed: bool,
}

/// Single-shot timer. Every `set()` replaces any pending arm and returns a
/// new sequence number; `try_cancel(seq)` only disarms if no newer arm has
/// happened since `seq` was observed.
pub struct RetryTimer {
    name: String,
    interval: IntervalSource,
    callback: TimerCallback,
    state: Mutex<TimerState>,
}

impl fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "RetryTimer({}, seq {}, set {})",
            self.name, state.sequence, state.is_set
        )
    }
}

impl RetryTimer {
    pub fn new(
        name: impl Into<String>,
        interval: IntervalSource,
        callback: TimerCallback,
    ) -> Arc<Self> {
        Arc::new(RetryTimer {
            name: name.into(),
            interval,
            callback,
            state: Mutex::new(TimerState {
                sequence: 0,
                is_set: false,
                handle: None,
                closed: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms the timer for one retry interval from now, replacing any
    /// pending arm. Returns the new sequence number. No-op once closed.
    pub fn set(self: &Arc<Self>) -> u64 {
        let dur = (self.interval)();
        let mut state = self.state.lock();
        if state.closed {
            return state.sequence;
        }

        state.sequence += 1;
        let seq = state.sequence;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.is_set = true;

        let timer = self.clone();
        state.handle = Some(tokio::spawn(async move {
            time::sleep(dur).await;
            timer.fire(seq);
        }));
        seq
    }

    fn fire(&self, seq: u64) {
        {
            let mut state = self.state.lock();
            if state.closed || state.sequence != seq {
                return;
            }
            state.is_set = false;
            state.handle = None;
        }
        pf_trace!(self.name; "retry timer fired seq {}", seq);
        (self.callback)(seq);
    }

    /// Disarms the timer if `seq` is still the latest arm. Returns true if
    /// the timer got disarmed.
    pub fn try_cancel(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.sequence != seq || !state.is_set {
            return false;
        }
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.is_set = false;
        true
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().is_set
    }

    /// Latest sequence number handed out.
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Disarms the timer for good; later arms and pending fires are ignored.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.is_set = false;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }
}
