//! Custom error types for the station.
//!
//! This module defines the primary error type, `StationError`, for the whole
//! application. Using the `thiserror` crate, it provides one consistent
//! vocabulary for everything that can go wrong between the supervisory side
//! and the worker units.
//!
//! Three variants carry the engine's fault model:
//!
//! - **`ModeViolation`**: an operation was requested outside its allowed-mode
//!   mask. Rejected, never fatal; the request never reaches the worker.
//! - **`WorkerExecution`**: a driver call failed (error return or contained
//!   panic). The operation aborts, the failure is surfaced to the tab's
//!   event channel, and the tab remains schedulable.
//! - **`Restarted`**: a forced worker restart discarded the request. This is
//!   the only way in-flight request state is lost.
//!
//! Failures inside a worker call never propagate as a crash of the
//! supervisory process.

use crate::core::Mode;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("operation '{operation}' not allowed in {mode} mode")]
    ModeViolation { operation: String, mode: Mode },

    #[error("worker failed executing '{operation}': {detail}")]
    WorkerExecution { operation: String, detail: String },

    #[error("no operation named '{0}'")]
    UnknownOperation(String),

    #[error("worker for tab '{tab}' is not responding")]
    WorkerUnresponsive { tab: String },

    #[error("request discarded by worker restart")]
    Restarted,

    #[error("operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("operation '{operation}' expects {expected}")]
    InvalidArguments {
        operation: String,
        expected: &'static str,
    },

    #[error("tab is shut down")]
    TabClosed,

    #[error("no tab named '{0}'")]
    UnknownTab(String),

    #[error("tab '{0}' already exists")]
    TabExists(String),

    #[error("no driver registered for device type '{0}'")]
    UnknownDriver(String),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StationError {
    /// Collapse a driver-side failure into the captured form surfaced to
    /// the error sink. Unknown-operation replies keep their identity so
    /// callers can distinguish a missing table entry from a failing one.
    pub fn worker_failure(operation: &str, detail: impl ToString) -> Self {
        StationError::WorkerExecution {
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mode_violation() {
        let err = StationError::ModeViolation {
            operation: "program_manual".into(),
            mode: Mode::Buffered,
        };
        assert_eq!(
            err.to_string(),
            "operation 'program_manual' not allowed in buffered mode"
        );
    }

    #[test]
    fn display_worker_failure() {
        let err = StationError::worker_failure("zero_sensor", "no response");
        assert!(err.to_string().contains("zero_sensor"));
        assert!(err.to_string().contains("no response"));
    }
}
