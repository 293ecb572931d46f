//! Error types for golem-servo

use thiserror::Error;

/// Servo subsystem error type
#[derive(Debug, Error)]
pub enum ServoError {
    /// PWM bus I/O failure
    #[error("PWM bus error: {0}")]
    Bus(String),

    /// Invalid servo configuration
    #[error("invalid servo config: {0}")]
    Config(String),

    /// Registry constraint violation (duplicate name or channel)
    #[error("registry error: {0}")]
    Registry(String),

    /// Calibration file could not be read or parsed
    #[error("calibration error: {0}")]
    Calibration(String),

    /// Unknown servo name
    #[error("unknown servo: {0}")]
    UnknownServo(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ServoError>;
