//! Error types for golem-vision

use thiserror::Error;

/// Vision subsystem error type
#[derive(Debug, Error)]
pub enum VisionError {
    /// No complete response within the invoke timeout
    #[error("vision invoke timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed frame from the detector board
    #[error("vision protocol error: {0}")]
    Protocol(String),

    /// Serial link failure
    #[error("vision serial error: {0}")]
    Serial(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, VisionError>;
