//! Golem Audio - microphone front end
//!
//! The capture side of the robot's voice pipeline:
//! - Microphone recorder (cpal) producing mono PCM16 at 16 kHz with
//!   software gain and optional AGC
//! - Frame-exact speech endpointing (WebRTC VAD, preroll + hangover)
//! - Wake-word detection with debounce, post-TTS suppression and rearm
//! - Half-duplex gate muting the mic path during TTS output

#![forbid(unsafe_code)]

pub mod endpoint;
pub mod error;
pub mod gate;
pub mod input;
pub mod vad;
pub mod wake;

pub use endpoint::{EndpointConfig, EndpointOutcome, SpeechEndpoint, Utterance};
pub use error::{AudioError, Result};
pub use gate::{ListenGate, TtsGate, TtsTurn};
pub use input::{pcm16_to_wav, Microphone, Recorder, RecorderConfig};
pub use vad::{VadEngine, WebRtcVadEngine};
pub use wake::{EnergyScorer, WakeConfig, WakeEvent, WakeScorer, WakeWordDetector};
