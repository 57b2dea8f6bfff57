//! Backoff timer utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::FailoverError;

use rand::Rng;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for re-sending or re-polling after a timeout. Each restart
/// may grow the duration geometrically up to a cap, with a small random
/// jitter so that many timers armed together do not fire in lockstep.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last restart.
    last_dur: Duration,

    /// Base duration the backoff sequence starts from.
    base_dur: Duration,

    /// Upper bound on the backoff duration.
    max_dur: Duration,

    /// Multiplicative backoff factor; 1 means fixed-interval.
    factor: u32,

    /// Is the timer currently armed?
    armed: bool,
}

impl Timer {
    /// Creates a fixed-interval timer that is not armed yet.
    pub fn new(base_dur: Duration) -> Self {
        Self::with_backoff(base_dur, 1, base_dur)
    }

    /// Creates a timer whose duration multiplies by `factor` on every
    /// `backoff()` call, capped at `max_dur`.
    pub fn with_backoff(base_dur: Duration, factor: u32, max_dur: Duration) -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: base_dur,
            base_dur,
            max_dur: max_dur.max(base_dur),
            factor: factor.max(1),
            armed: false,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Is the timer armed?
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), FailoverError> {
        if dur.is_zero() {
            return Err(FailoverError::InvalidState(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + Self::jittered(dur));
        Ok(())
    }

    /// Restarts the timer with the base duration, resetting the backoff.
    pub fn kickoff(&mut self) -> Result<(), FailoverError> {
        self.restart(self.base_dur)
    }

    /// Restarts the timer with the next duration in the backoff sequence.
    pub fn backoff(&mut self) -> Result<(), FailoverError> {
        let next = (self.last_dur * self.factor).min(self.max_dur);
        self.restart(next)
    }

    /// Disarms the timer; `timeout()` will pend forever until restarted.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`. Never completes while disarmed.
    pub async fn timeout(&mut self) {
        if !self.armed {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }

    // at most 1/16 extra on top of the requested duration
    fn jittered(dur: Duration) -> Duration {
        let spread = (dur.as_millis() as u64) / 16;
        if spread == 0 {
            dur
        } else {
            dur + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
        }
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new(Duration::from_millis(50));
        assert!(!timer.is_armed());
        assert_eq!(timer.get_dur(), Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_zero_rejected() {
        let mut timer = Timer::new(Duration::from_millis(50));
        assert!(timer.restart(Duration::ZERO).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_backoff() -> Result<(), FailoverError> {
        let mut timer = Timer::with_backoff(
            Duration::from_millis(100),
            2,
            Duration::from_millis(300),
        );
        // round 1 with base timeout
        let mut start = Instant::now();
        timer.kickoff()?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(100));
        assert!(!timer.is_armed());
        // round 2 doubled
        start = Instant::now();
        timer.backoff()?;
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        assert_eq!(timer.get_dur(), Duration::from_millis(200));
        // round 3 capped
        timer.backoff()?;
        assert_eq!(timer.get_dur(), Duration::from_millis(300));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancelled_pends() -> Result<(), FailoverError> {
        let mut timer = Timer::new(Duration::from_millis(10));
        timer.kickoff()?;
        timer.cancel();
        let res = tokio::time::timeout(
            Duration::from_millis(100),
            timer.timeout(),
        )
        .await;
        assert!(res.is_err());
        Ok(())
    }
}
