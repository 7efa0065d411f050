//! Custom error types for the gantry core.
//!
//! This module defines the primary error type, `GantryError`, for the whole crate.
//! Using the `thiserror` crate, it gives every failure mode of the motion stack a
//! specific variant, so callers can decide on a recovery action without inspecting
//! message text.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: Wraps `ValidationError` (`NotHomed`, `OutOfBounds`,
//!   `InvalidCellId`). Always raised before any byte reaches the serial link.
//! - **`Connection`** / **`NotConnected`**: The link could not be opened or was lost.
//!   The controller is closed and an explicit reconnect is required.
//! - **`Protocol`**: A response line matched no known grammar. The outcome of the
//!   command is unknown.
//! - **`Timeout`**: No terminal response arrived within the command deadline. The
//!   physical effect of the command is unknown.
//! - **`SafetyFault`**: The controller reported an alarm. Requires `reset`.
//! - **`CommandRejected`**: The controller answered `error:<code>`.
//! - **`Busy`**, **`Interrupted`**, **`InvalidState`**: Orchestrator-level refusals.
//! - **`Configuration`**: Semantic errors in the supplied configuration.
//!
//! By using `#[from]`, validation and I/O errors convert with the `?` operator.

use crate::motion::MachineStatus;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, GantryError>;

/// Axis label used in bounds errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Gantry X axis (board files).
    X,
    /// Gantry Y axis (board ranks).
    Y,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}

/// Failures detected locally, before any hardware contact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Motion requested while the machine is not homed and idle.
    #[error("Machine not homed (state: {state})")]
    NotHomed {
        /// State the machine was in when the request was refused.
        state: MachineStatus,
    },

    /// Target lies outside the configured travel envelope.
    #[error("{axis}={value:.3} out of range [{min:.3}, {max:.3}]")]
    OutOfBounds {
        /// Offending axis.
        axis: Axis,
        /// Requested coordinate in millimetres.
        value: f64,
        /// Envelope minimum.
        min: f64,
        /// Envelope maximum.
        max: f64,
    },

    /// Cell identifier rejected by the parser.
    #[error("Invalid cell id '{input}': {reason}")]
    InvalidCellId {
        /// Raw caller input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Primary error type for the gantry motion core.
#[derive(Error, Debug)]
pub enum GantryError {
    /// The serial link could not be opened or was lost mid-operation.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation needing the link was attempted while it is closed.
    #[error("Serial link not connected")]
    NotConnected,

    /// A response line matched none of the known grammars.
    #[error("Protocol error: unrecognized response '{line}'")]
    Protocol {
        /// The offending line (or a description of the violation).
        line: String,
    },

    /// No terminal response within the command deadline. Outcome unknown.
    #[error("Timed out after {timeout:?} waiting for response to '{command}'")]
    Timeout {
        /// Frame that was sent.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Local validation failure. No command was sent.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The controller raised an alarm.
    #[error("Safety fault: ALARM:{code}")]
    SafetyFault {
        /// GRBL alarm code.
        code: u16,
    },

    /// The controller answered the command with an error code.
    #[error("Controller rejected '{command}': error:{code}")]
    CommandRejected {
        /// Frame that was rejected.
        command: String,
        /// GRBL error code.
        code: u16,
    },

    /// A motion request is already in flight.
    #[error("Motion controller busy")]
    Busy,

    /// The operation was overtaken by an emergency stop.
    #[error("Operation interrupted by emergency stop")]
    Interrupted,

    /// Operation not permitted in the current machine state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Name of the refused operation.
        operation: &'static str,
        /// State at the time of the request.
        state: MachineStatus,
    },

    /// Semantically invalid configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Functionality compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl GantryError {
    /// True when the link is gone and `connect` must be called again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, GantryError::Connection(_) | GantryError::NotConnected)
    }

    /// True when the physical effect of the last command cannot be assumed.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            GantryError::Timeout { .. } | GantryError::Protocol { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GantryError::Connection("port vanished".to_string());
        assert_eq!(err.to_string(), "Connection error: port vanished");
    }

    #[test]
    fn test_out_of_bounds_display() {
        let err = ValidationError::OutOfBounds {
            axis: Axis::X,
            value: 401.5,
            min: 0.0,
            max: 400.0,
        };
        assert_eq!(err.to_string(), "X=401.500 out of range [0.000, 400.000]");
    }

    #[test]
    fn test_rejected_display() {
        let err = GantryError::CommandRejected {
            command: "G1 X10".into(),
            code: 9,
        };
        assert_eq!(err.to_string(), "Controller rejected 'G1 X10': error:9");
    }

    #[test]
    fn test_classification() {
        assert!(GantryError::NotConnected.requires_reconnect());
        assert!(GantryError::Timeout {
            command: "G1".into(),
            timeout: Duration::from_secs(5)
        }
        .outcome_unknown());
        let validation: GantryError = ValidationError::NotHomed {
            state: MachineStatus::Connected,
        }
        .into();
        assert!(matches!(validation, GantryError::Validation(_)));
        assert!(!validation.outcome_unknown());
        assert!(!validation.requires_reconnect());
    }
}
