//! Golem Services - external collaborators
//!
//! Narrow clients for the services the robot depends on but does not
//! host: the speech-to-text HTTP endpoint, the chat model, and the
//! text-to-speech engine reachable over MQTT, a named pipe or a local
//! subprocess.

#![forbid(unsafe_code)]

pub mod error;
pub mod llm;
pub mod stt;
pub mod tts;

pub use error::{Result, ServiceError};
pub use llm::{ChatMessage, ChatModel, LlmClient, LlmConfig};
pub use stt::{SpeechToText, SttClient, SttConfig, Transcript};
pub use tts::{
    estimate_speech, FifoTts, FifoTtsConfig, MqttTts, MqttTtsConfig, Speaker, SpeakerConfig,
    SpeechOutput, StatusRegistry, SubprocessTts, SubprocessTtsConfig, TtsBackend, TtsJob,
    TtsState,
};
