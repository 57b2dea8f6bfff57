//! Reconfiguration epochs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Low half of the configuration version counts secondary-only changes;
/// the high half counts primary changes.
const PRIMARY_EPOCH_MASK: i64 = !0xFFFF_FFFF;

/// (DataLossVersion, ConfigurationVersion) pair identifying a
/// reconfiguration generation. Ordered lexicographically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Epoch {
    pub data_loss_version: i64,
    pub configuration_version: i64,
}

impl Epoch {
    pub fn new(data_loss_version: i64, configuration_version: i64) -> Self {
        Epoch {
            data_loss_version,
            configuration_version,
        }
    }

    /// The epoch used while no previous configuration exists.
    pub fn invalid() -> Self {
        Epoch::default()
    }

    pub fn is_valid(&self) -> bool {
        *self != Epoch::invalid()
    }

    /// Projection that only changes when the primary changes.
    pub fn primary_epoch(&self) -> Epoch {
        Epoch {
            data_loss_version: self.data_loss_version,
            configuration_version: self.configuration_version & PRIMARY_EPOCH_MASK,
        }
    }

    /// Next epoch for a reconfiguration that elects a new primary.
    pub fn next_primary(&self) -> Epoch {
        let primary_part = (self.configuration_version >> 32) + 1;
        Epoch {
            data_loss_version: self.data_loss_version,
            configuration_version: primary_part << 32,
        }
    }

    /// Next epoch for a reconfiguration that keeps the primary.
    pub fn next_configuration(&self) -> Epoch {
        Epoch {
            data_loss_version: self.data_loss_version,
            configuration_version: self.configuration_version + 1,
        }
    }

    /// Next epoch after declaring data loss.
    pub fn next_data_loss(&self) -> Epoch {
        Epoch {
            data_loss_version: self.data_loss_version + 1,
            configuration_version: ((self.configuration_version >> 32) + 1) << 32,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}.{}",
            self.data_loss_version,
            self.configuration_version >> 32,
            self.configuration_version & 0xFFFF_FFFF
        )
    }
}
