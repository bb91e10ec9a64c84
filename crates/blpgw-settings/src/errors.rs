//! Settings error types.

use blpgw_core::{Classify, ErrorClass};
use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., zero where a positive size is required).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

impl Classify for SettingsError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Json(_) => ErrorClass::Internal,
            Self::InvalidValue(_) => ErrorClass::Misuse,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
