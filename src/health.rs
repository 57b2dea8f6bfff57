//! Health reporting sink and continuous-failure counters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

/// Health state of a reported entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Ok,
    Warning,
    Error,
}

/// One health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub entity: String,
    pub state: HealthState,
    pub description: String,
}

/// Fire-and-forget health sink. Implementations must not block.
pub trait HealthReportSink: Send + Sync {
    fn report_health(&self, entity: &str, state: HealthState, description: &str);
}

/// Sink that only logs reports.
#[derive(Debug, Default)]
pub struct LoggingHealthSink;

impl HealthReportSink for LoggingHealthSink {
    fn report_health(&self, entity: &str, state: HealthState, description: &str) {
        match state {
            HealthState::Ok => pf_debug!("health"; "{} Ok: {}", entity, description),
            HealthState::Warning => {
                pf_warn!("health"; "{} Warning: {}", entity, description)
            }
            HealthState::Error => {
                pf_error!("health"; "{} Error: {}", entity, description)
            }
        }
    }
}

/// Sink that keeps the latest report per entity plus the full history;
/// used by queries and tests.
#[derive(Debug, Default)]
pub struct CollectingHealthSink {
    latest: Mutex<HashMap<String, HealthReport>>,
    history: Mutex<Vec<HealthReport>>,
}

impl CollectingHealthSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self, entity: &str) -> Option<HealthReport> {
        self.latest.lock().get(entity).cloned()
    }

    pub fn history(&self) -> Vec<HealthReport> {
        self.history.lock().clone()
    }

    /// Entities whose latest state is not Ok.
    pub fn unhealthy(&self) -> Vec<HealthReport> {
        let mut reports: Vec<HealthReport> = self
            .latest
            .lock()
            .values()
            .filter(|r| r.state != HealthState::Ok)
            .cloned()
            .collect();
        reports.sort_by(|a, b| a.entity.cmp(&b.entity));
        reports
    }
}

impl HealthReportSink for CollectingHealthSink {
    fn report_health(&self, entity: &str, state: HealthState, description: &str) {
        let report = HealthReport {
            entity: entity.into(),
            state,
            description: description.into(),
        };
        self.history.lock().push(report.clone());
        self.latest.lock().insert(entity.into(), report);
    }
}

/// Counts continuous failures of one kind of operation (replica open,
/// replica close, ...) and maps the count to a health state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounter {
    count: u32,
}

impl FailureCounter {
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Records a failure and returns the resulting health state.
    pub fn on_failure(&mut self, warning_at: u32, error_at: u32) -> HealthState {
        self.count = self.count.saturating_add(1);
        self.state(warning_at, error_at)
    }

    /// Records a success. Returns true if the counter was non-zero, i.e. a
    /// previously reported unhealthy state should be cleared.
    pub fn on_success(&mut self) -> bool {
        let was_failing = self.count > 0;
        self.count = 0;
        was_failing
    }

    pub fn state(&self, warning_at: u32, error_at: u32) -> HealthState {
        if self.count >= error_at {
            HealthState::Error
        } else if self.count >= warning_at {
            HealthState::Warning
        } else {
            HealthState::Ok
        }
    }
}

impl fmt::Display for FailureCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.count)
    }
}

#[cfg(test)]
mod health_tests {
    use super::*;

    #[test]
    fn failure_counter_escalates() {
        let mut counter = FailureCounter::default();
        assert_eq!(counter.on_failure(2, 4), HealthState::Ok);
        assert_eq!(counter.on_failure(2, 4), HealthState::Warning);
        assert_eq!(counter.on_failure(2, 4), HealthState::Warning);
        assert_eq!(counter.on_failure(2, 4), HealthState::Error);
        assert!(counter.on_success());
        assert!(!counter.on_success());
        assert_eq!(counter.state(2, 4), HealthState::Ok);
    }

    #[test]
    fn collecting_sink() {
        let sink = CollectingHealthSink::new();
        sink.report_health("fu-1", HealthState::Warning, "open failed");
        sink.report_health("fu-2", HealthState::Ok, "fine");
        sink.report_health("fu-1", HealthState::Error, "open failed again");
        assert_eq!(sink.history().len(), 3);
        assert_eq!(sink.latest("fu-1").unwrap().state, HealthState::Error);
        let unhealthy = sink.unhealthy();
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].entity, "fu-1");
    }
}
