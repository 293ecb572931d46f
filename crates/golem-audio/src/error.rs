//! Error types for golem-audio

use thiserror::Error;

/// Audio pipeline error type
#[derive(Debug, Error)]
pub enum AudioError {
    /// Audio device error
    #[error("audio device error: {0}")]
    Device(String),

    /// Audio stream error
    #[error("audio stream error: {0}")]
    Stream(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    Wake(String),

    /// Invalid pipeline configuration
    #[error("audio config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AudioError>;
