//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur
//! while a protocol is executing.
//!
//! Two families of variants are worth distinguishing:
//!
//! - **Runtime conditions** (`DeviceDisconnected`, `ProcessFault`,
//!   `Evaluation`) are expected during normal operation and are absorbed by
//!   the layer above: the adapter turns device loss into lifecycle events,
//!   the master turns process faults into a paused-with-error state.
//! - **Invariant violations** (`AlreadyPaused`, `NotPaused`, `ProcessHalted`,
//!   `InvalidTransition`, `SegmentOutOfRange`) indicate caller bugs. They
//!   fail fast and must not be retried or silently handled.

use crate::eval::Diagnostics;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Primary error type for the protocol engine.
#[derive(Error, Debug)]
pub enum LabError {
    #[error("device is disconnected")]
    DeviceDisconnected,

    #[error("adapter is stopped")]
    AdapterStopped,

    #[error("already paused")]
    AlreadyPaused,

    #[error("not paused")]
    NotPaused,

    #[error("process is halted")]
    ProcessHalted,

    #[error("cannot {op} while {mode}")]
    InvalidTransition {
        /// Operation that was attempted.
        op: &'static str,
        /// Mode the state machine was in.
        mode: &'static str,
    },

    #[error("not running")]
    NotRunning,

    #[error("already started")]
    AlreadyStarted,

    #[error("no segment at index {0}")]
    SegmentOutOfRange(usize),

    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("process fault: {0}")]
    ProcessFault(String),

    #[error("evaluation failed: {0}")]
    Evaluation(#[from] Diagnostics),

    #[error("device error: {0}")]
    Device(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::ProcessFault("valve jammed".to_string());
        assert_eq!(err.to_string(), "process fault: valve jammed");
    }

    #[test]
    fn test_invariant_error_display() {
        let err = LabError::InvalidTransition {
            op: "pause",
            mode: "waiting forever",
        };
        assert_eq!(err.to_string(), "cannot pause while waiting forever");
    }
}
