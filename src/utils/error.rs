//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

/// Customized error type for the failover core. The variant tells callers
/// how the failure should be treated; the payload is a human-readable
/// description.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum FailoverError {
    /// Lock acquisition or request timed out. Retryable.
    Timeout(String),

    /// Incoming command older than the currently known state.
    Stale(String),

    /// Entity or endpoint not found.
    NotFound(String),

    /// Operation not valid in the entity's current state.
    InvalidState(String),

    /// Not enough resources (nodes, capacity, ...) to proceed.
    InsufficientResources(String),

    /// Component has not finished its startup handshake. Retryable.
    NotReady(String),

    /// Component has been closed or the operation was cancelled.
    Closed(String),

    /// Persisting a committed transition failed; in-memory state was rolled
    /// back.
    CommitFailed(String),

    /// Any other error.
    Msg(String),
}

impl FailoverError {
    pub fn msg(msg: impl ToString) -> Self {
        FailoverError::Msg(msg.to_string())
    }

    /// Returns true if the caller should retry the failed operation later
    /// instead of treating the error as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailoverError::Timeout(_) | FailoverError::NotReady(_))
    }

    /// Returns true if the error means the request was superseded.
    pub fn is_stale(&self) -> bool {
        matches!(self, FailoverError::Stale(_))
    }

    fn text(&self) -> &str {
        match self {
            FailoverError::Timeout(s)
            | FailoverError::Stale(s)
            | FailoverError::NotFound(s)
            | FailoverError::InvalidState(s)
            | FailoverError::InsufficientResources(s)
            | FailoverError::NotReady(s)
            | FailoverError::Closed(s)
            | FailoverError::CommitFailed(s)
            | FailoverError::Msg(s) => s,
        }
    }
}

impl fmt::Display for FailoverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailoverError::Msg(s) => write!(f, "{}", s),
            FailoverError::Timeout(_) => write!(f, "timeout: {}", self.text()),
            FailoverError::Stale(_) => write!(f, "stale: {}", self.text()),
            FailoverError::NotFound(_) => {
                write!(f, "not found: {}", self.text())
            }
            FailoverError::InvalidState(_) => {
                write!(f, "invalid state: {}", self.text())
            }
            FailoverError::InsufficientResources(_) => {
                write!(f, "insufficient resources: {}", self.text())
            }
            FailoverError::NotReady(_) => {
                write!(f, "not ready: {}", self.text())
            }
            FailoverError::Closed(_) => write!(f, "closed: {}", self.text()),
            FailoverError::CommitFailed(_) => {
                write!(f, "commit failed: {}", self.text())
            }
        }
    }
}

impl error::Error for FailoverError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `FailoverError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for FailoverError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                FailoverError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `FailoverError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for FailoverError {
            fn from(e: $error) -> FailoverError {
                FailoverError::Closed(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(uuid::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

impl From<tokio::time::error::Elapsed> for FailoverError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        FailoverError::Timeout(e.to_string())
    }
}
