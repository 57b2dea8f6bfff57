//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timer;
mod operation;

pub use error::FailoverError;
pub use print::logger_init;
pub use timer::Timer;
pub use operation::{AsyncOperation, OperationOutcome};
