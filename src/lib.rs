//! Failover core: the failover manager that owns partition replica sets,
//! and the reconfiguration agent that runs them on every node.

#[macro_use]
mod utils;

pub mod agent;
pub mod background;
pub mod config;
pub mod failover;
pub mod health;
pub mod jobs;
pub mod manager;
pub mod messaging;
pub mod store;

pub use utils::{logger_init, AsyncOperation, FailoverError, OperationOutcome, Timer};

pub use agent::{InProcessHost, ReconfigurationAgent, ReplicaHost};
pub use config::{ConfigHandle, FailoverConfig};
pub use manager::{FailoverManager, ManagerBackends};
