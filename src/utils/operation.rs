//! Single-delivery async operation handle with race-free cancellation.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use tokio::sync::Notify;

const RUNNING: u8 = 0;
const COMPLETING: u8 = 1;
const COMPLETED: u8 = 2;

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome<T> {
    Completed(T),
    Cancelled,
}

/// An operation that is completed exactly once, either normally or by
/// cancellation. Whoever wins `try_start_complete()` is the only party
/// allowed to deliver the outcome; the loser's attempt is a no-op.
pub struct AsyncOperation<T> {
    state: AtomicU8,
    outcome: Mutex<Option<OperationOutcome<T>>>,
    notify: Notify,
}

impl<T> fmt::Debug for AsyncOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AsyncOperation({})", self.state.load(Ordering::Acquire))
    }
}

impl<T> Default for AsyncOperation<T> {
    fn default() -> Self {
        AsyncOperation {
            state: AtomicU8::new(RUNNING),
            outcome: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T: Clone> AsyncOperation<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to complete this operation.
    pub fn try_start_complete(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Delivers the outcome; must follow a successful `try_start_complete()`.
    pub fn finish_complete(&self, outcome: OperationOutcome<T>) {
        debug_assert_eq!(self.state.load(Ordering::Acquire), COMPLETING);
        *self.outcome.lock() = Some(outcome);
        self.state.store(COMPLETED, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Completes with a value. Returns false if already completed or
    /// cancelled.
    pub fn try_complete(&self, value: T) -> bool {
        if !self.try_start_complete() {
            return false;
        }
        self.finish_complete(OperationOutcome::Completed(value));
        true
    }

    /// Cancels the operation. Idempotent: returns false if it had already
    /// completed or been cancelled.
    pub fn cancel(&self) -> bool {
        if !self.try_start_complete() {
            return false;
        }
        self.finish_complete(OperationOutcome::Cancelled);
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.outcome.lock(), Some(OperationOutcome::Cancelled))
    }

    /// Returns the outcome if already delivered.
    pub fn outcome(&self) -> Option<OperationOutcome<T>> {
        self.outcome.lock().clone()
    }

    /// Waits until the outcome is delivered.
    pub async fn wait(&self) -> OperationOutcome<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.outcome.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }
}
