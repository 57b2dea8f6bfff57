//! Tunables consumed by the failover core, with hot reload.

use crate::utils::FailoverError;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::time::Duration;

/// Named tunables. Durations are in milliseconds so that they can be given
/// directly as TOML integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Max time a job item waits for an entity lock.
    pub lock_acquire_timeout_ms: u64,

    /// Wait before declaring data loss when quorum cannot be recovered.
    pub recover_on_data_loss_wait_duration_ms: u64,

    /// Grace period for a down replica to come back before it is replaced.
    /// Services may override it.
    pub replica_restart_wait_duration_ms: u64,

    /// Allow a singleton primary to be moved by temporarily placing a
    /// second replica.
    pub is_singleton_replica_move_allowed_during_upgrade: bool,

    /// Retry interval for messages to the replica host.
    pub rap_message_retry_interval_ms: u64,

    /// Throttle between consecutive runs of the replica host retry work.
    pub minimum_interval_between_rap_message_retry_ms: u64,

    /// Throttle between consecutive periodic state cleanup runs.
    pub minimum_interval_between_periodic_state_cleanup_ms: u64,

    /// Interval at which periodic state cleanup re-runs.
    pub periodic_state_cleanup_interval_ms: u64,

    /// Retry interval for reconfiguration messages between agents.
    pub reconfiguration_message_retry_interval_ms: u64,

    /// Initial retry interval for requests to the FM.
    pub fm_message_retry_interval_ms: u64,

    /// How long a deleted failover unit is kept as a tombstone on the agent.
    pub deleted_failover_unit_tombstone_duration_ms: u64,

    /// Interval of the FM background state machine scan.
    pub fm_background_scan_interval_ms: u64,

    /// Continuous failures before a Warning health report.
    pub continuous_failure_warning_threshold: u32,

    /// Continuous failures before an Error health report.
    pub continuous_failure_error_threshold: u32,

    /// Interval of the FM load persistence flush.
    pub load_persist_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            lock_acquire_timeout_ms: 2000,
            recover_on_data_loss_wait_duration_ms: 60_000,
            replica_restart_wait_duration_ms: 5_000,
            is_singleton_replica_move_allowed_during_upgrade: true,
            rap_message_retry_interval_ms: 500,
            minimum_interval_between_rap_message_retry_ms: 50,
            minimum_interval_between_periodic_state_cleanup_ms: 1_000,
            periodic_state_cleanup_interval_ms: 5_000,
            reconfiguration_message_retry_interval_ms: 500,
            fm_message_retry_interval_ms: 500,
            deleted_failover_unit_tombstone_duration_ms: 10_000,
            fm_background_scan_interval_ms: 300,
            continuous_failure_warning_threshold: 3,
            continuous_failure_error_threshold: 10,
            load_persist_interval_ms: 1_000,
        }
    }
}

impl FailoverConfig {
    /// Composes a config from defaults, overriding fields given in the TOML
    /// string.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, FailoverError> {
        let config = parsed_config!(config_str => FailoverConfig;
                                    lock_acquire_timeout_ms,
                                    recover_on_data_loss_wait_duration_ms,
                                    replica_restart_wait_duration_ms,
                                    is_singleton_replica_move_allowed_during_upgrade,
                                    rap_message_retry_interval_ms,
                                    minimum_interval_between_rap_message_retry_ms,
                                    minimum_interval_between_periodic_state_cleanup_ms,
                                    periodic_state_cleanup_interval_ms,
                                    reconfiguration_message_retry_interval_ms,
                                    fm_message_retry_interval_ms,
                                    deleted_failover_unit_tombstone_duration_ms,
                                    fm_background_scan_interval_ms,
                                    continuous_failure_warning_threshold,
                                    continuous_failure_error_threshold,
                                    load_persist_interval_ms)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), FailoverError> {
        if self.lock_acquire_timeout_ms == 0 {
            return Err(FailoverError::msg("lock_acquire_timeout_ms must be > 0"));
        }
        if self.rap_message_retry_interval_ms == 0
            || self.reconfiguration_message_retry_interval_ms == 0
            || self.fm_message_retry_interval_ms == 0
            || self.periodic_state_cleanup_interval_ms == 0
            || self.fm_background_scan_interval_ms == 0
            || self.load_persist_interval_ms == 0
        {
            return Err(FailoverError::msg("retry intervals must be > 0"));
        }
        if self.continuous_failure_warning_threshold
            > self.continuous_failure_error_threshold
        {
            return Err(FailoverError::msg(format!(
                "warning threshold {} above error threshold {}",
                self.continuous_failure_warning_threshold,
                self.continuous_failure_error_threshold
            )));
        }
        Ok(())
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn recover_on_data_loss_wait_duration(&self) -> Duration {
        Duration::from_millis(self.recover_on_data_loss_wait_duration_ms)
    }

    pub fn replica_restart_wait_duration(&self) -> Duration {
        Duration::from_millis(self.replica_restart_wait_duration_ms)
    }

    pub fn rap_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.rap_message_retry_interval_ms)
    }

    pub fn minimum_interval_between_rap_message_retry(&self) -> Duration {
        Duration::from_millis(self.minimum_interval_between_rap_message_retry_ms)
    }

    pub fn minimum_interval_between_periodic_state_cleanup(&self) -> Duration {
        Duration::from_millis(
            self.minimum_interval_between_periodic_state_cleanup_ms,
        )
    }

    pub fn periodic_state_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_state_cleanup_interval_ms)
    }

    pub fn reconfiguration_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reconfiguration_message_retry_interval_ms)
    }

    pub fn fm_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fm_message_retry_interval_ms)
    }

    pub fn deleted_failover_unit_tombstone_duration(&self) -> Duration {
        Duration::from_millis(self.deleted_failover_unit_tombstone_duration_ms)
    }

    pub fn fm_background_scan_interval(&self) -> Duration {
        Duration::from_millis(self.fm_background_scan_interval_ms)
    }

    pub fn load_persist_interval(&self) -> Duration {
        Duration::from_millis(self.load_persist_interval_ms)
    }
}

/// Shared handle to the current config. Consumers call `get()` at each use,
/// so that a `reload()` takes effect on the next use without restarts.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<FailoverConfig>,
    tx: std::sync::Arc<watch::Sender<FailoverConfig>>,
}

impl ConfigHandle {
    pub fn new(config: FailoverConfig) -> Self {
        let (tx, rx) = watch::channel(config);
        ConfigHandle {
            rx,
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Snapshot of the current config.
    pub fn get(&self) -> FailoverConfig {
        self.rx.borrow().clone()
    }

    /// Replaces the config with one parsed from TOML, keeping the old one on
    /// parse failure.
    pub fn reload(&self, config_str: &str) -> Result<(), FailoverError> {
        let config = FailoverConfig::from_toml(Some(config_str))?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Applies an in-place edit to the current config.
    pub fn update(&self, edit: impl FnOnce(&mut FailoverConfig)) {
        self.tx.send_modify(edit);
    }

    /// Receiver that resolves whenever the config changes.
    pub fn subscribe(&self) -> watch::Receiver<FailoverConfig> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(FailoverConfig::default())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_valid() -> Result<(), FailoverError> {
        let config = FailoverConfig::from_toml(None)?;
        assert_eq!(config, FailoverConfig::default());
        assert_eq!(config.lock_acquire_timeout(), Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn override_fields() -> Result<(), FailoverError> {
        let config = FailoverConfig::from_toml(Some(
            "replica_restart_wait_duration_ms = 100\n\
             is_singleton_replica_move_allowed_during_upgrade = false",
        ))?;
        assert_eq!(
            config.replica_restart_wait_duration(),
            Duration::from_millis(100)
        );
        assert!(!config.is_singleton_replica_move_allowed_during_upgrade);
        Ok(())
    }

    #[test]
    fn reject_invalid() {
        assert!(FailoverConfig::from_toml(Some("lock_acquire_timeout_ms = 0"))
            .is_err());
        assert!(FailoverConfig::from_toml(Some("bogus = 1")).is_err());
        assert!(FailoverConfig::from_toml(Some(
            "continuous_failure_warning_threshold = 20"
        ))
        .is_err());
    }

    #[test]
    fn hot_reload() -> Result<(), FailoverError> {
        let handle = ConfigHandle::default();
        let reader = handle.clone();
        handle.reload("rap_message_retry_interval_ms = 42")?;
        assert_eq!(
            reader.get().rap_message_retry_interval(),
            Duration::from_millis(42)
        );
        // failed reload keeps the old values
        assert!(handle.reload("rap_message_retry_interval_ms = 0").is_err());
        assert_eq!(reader.get().rap_message_retry_interval_ms, 42);
        handle.update(|c| c.lock_acquire_timeout_ms = 7);
        assert_eq!(reader.get().lock_acquire_timeout_ms, 7);
        Ok(())
    }
}
