//! Unified error types for Pulse

use thiserror::Error;

/// Unified error type for hub and agent operations
#[derive(Error, Debug)]
pub enum PulseError {
    // Protocol security errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Unknown or expired correlation id: {0}")]
    CorrelationMismatch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Connection errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Hub errors
    #[error("No registered validators online")]
    NoValidatorsOnline,

    #[error("Validator not found: {0}")]
    ValidatorNotFound(String),

    // Key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using PulseError
pub type Result<T> = std::result::Result<T, PulseError>;
