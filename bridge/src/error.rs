//! Error types for the process shell
//!
//! The engine itself never fails a tick; these cover what can go wrong
//! around it: settings storage and log files.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    // =========================================================================
    // Settings
    // =========================================================================

    #[error("Settings error: {path} - {reason}")]
    Settings { path: String, reason: String },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    // =========================================================================
    // I/O
    // =========================================================================

    #[error("File I/O error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn settings(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Settings {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors the user can fix by editing or deleting the settings file.
    pub fn is_settings_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Settings { .. } | BridgeError::InvalidSettings(_)
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::IoError(e.to_string())
    }
}

impl From<astrocam_sequencer::EngineError> for BridgeError {
    fn from(e: astrocam_sequencer::EngineError) -> Self {
        BridgeError::InvalidSettings(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
