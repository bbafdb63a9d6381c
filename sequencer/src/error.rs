//! Error types for the session engine
//!
//! Every failure the engine can see falls into one of the categories of
//! [`EngineError`]. None of them is allowed to escape the engine tick:
//! the engine translates each into a user-visible notice and carries on.
//!
//! Port-level errors ([`ExposureError`], [`PersistError`]) stay narrow so
//! that fakes and real drivers only have to describe what they observed.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by an exposure port.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExposureError {
    /// Device fault while exposing or reading out
    #[error("Camera hardware error: {0}")]
    Hardware(String),

    /// Camera vanished from the bus
    #[error("Camera disconnected: {0}")]
    Disconnected(String),

    #[error("Exposure timed out after {timeout_secs:.1}s")]
    Timeout { timeout_secs: f64 },
}

impl ExposureError {
    pub fn timeout(after: Duration) -> Self {
        ExposureError::Timeout {
            timeout_secs: after.as_secs_f64(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExposureError::Timeout { .. })
    }
}

/// Failure while writing a frame to durable storage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("Write failed for {path}: {reason}")]
    Write { path: String, reason: String },

    /// Data written but the durability flush did not succeed
    #[error("Flush failed for {path}: {reason}")]
    Flush { path: String, reason: String },

    #[error("Persistence task aborted: {0}")]
    Aborted(String),
}

impl PersistError {
    pub fn write(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PersistError::Write {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Engine-level error taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // =========================================================================
    // Recoverable, surfaced as a notice
    // =========================================================================

    /// Operation requested in the wrong mode or state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No usable plate solution right now
    #[error("No plate solution: {0}")]
    NoSolution(String),

    /// Solve or hardware call exceeded its bound; retried on a later tick
    #[error("{operation} timed out after {timeout_secs:.1}s")]
    Timeout { operation: String, timeout_secs: f64 },

    /// RA moved less than the configured minimum between polar measurements
    #[error("Insufficient RA rotation: {measured_deg:.1}° (need {required_deg:.1}°)")]
    InsufficientRotation { measured_deg: f64, required_deg: f64 },

    // =========================================================================
    // Fatal to the current session only
    // =========================================================================

    #[error("Hardware error: {0}")]
    HardwareError(String),

    /// Frame could not be made durable; the session pauses
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

impl EngineError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub fn no_solution(msg: impl Into<String>) -> Self {
        EngineError::NoSolution(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            timeout_secs: after.as_secs_f64(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }

    /// Whether the error ends (or pauses) the active capture session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::HardwareError(_) | EngineError::PersistenceFailure(_)
        )
    }

    /// Short label for the status line.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidState(_) => "NOT NOW",
            EngineError::NoSolution(_) => "NO SOLVE",
            EngineError::Timeout { .. } => "TIMEOUT",
            EngineError::InsufficientRotation { .. } => "ROTATE MORE",
            EngineError::HardwareError(_) => "NO SIGNAL",
            EngineError::PersistenceFailure(_) => "SAVE FAILED",
        }
    }
}

impl From<ExposureError> for EngineError {
    fn from(e: ExposureError) -> Self {
        match e {
            ExposureError::Timeout { timeout_secs } => EngineError::Timeout {
                operation: "Exposure".to_string(),
                timeout_secs,
            },
            ExposureError::Hardware(m) => EngineError::HardwareError(m),
            ExposureError::Disconnected(m) => {
                EngineError::HardwareError(format!("disconnected: {}", m))
            }
        }
    }
}

impl From<PersistError> for EngineError {
    fn from(e: PersistError) -> Self {
        EngineError::PersistenceFailure(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
