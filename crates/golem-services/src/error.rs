//! Error types for golem-services

use thiserror::Error;

/// External service error type
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Speech-to-text request failed
    #[error("STT error: {0}")]
    Stt(String),

    /// Chat completion failed
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech failed
    #[error("TTS error: {0}")]
    Tts(String),

    /// Every configured TTS backend refused the request
    #[error("all TTS backends failed")]
    AllTtsBackendsFailed,

    /// Dependency probe failed during startup
    #[error("service unhealthy: {0}")]
    Unhealthy(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Response did not match the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ServiceError>;
