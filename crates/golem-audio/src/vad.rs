//! Voice activity detection.
//!
//! The endpointer consumes per-frame speech decisions through the
//! [`VadEngine`] trait; the production engine wraps WebRTC VAD, tests
//! inject scripted decisions so `record()` stays deterministic.

use crate::error::{AudioError, Result};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Per-frame speech classifier.
pub trait VadEngine {
    /// Classify one PCM16 frame (10/20/30 ms) as speech or not.
    fn is_speech(&mut self, frame: &[u8], sample_rate: u32) -> bool;
}

/// WebRTC VAD at a configured aggressiveness (0..3).
pub struct WebRtcVadEngine {
    vad: Vad,
    scratch: Vec<i16>,
}

impl WebRtcVadEngine {
    /// Create an engine; aggressiveness above 3 is rejected.
    pub fn new(sample_rate: u32, aggressiveness: u8) -> Result<Self> {
        let rate = match sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            other => {
                return Err(AudioError::Config(format!(
                    "WebRTC VAD does not support {other} Hz"
                )))
            }
        };
        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(AudioError::Config(format!(
                    "VAD aggressiveness {other} outside 0..3"
                )))
            }
        };
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, mode),
            scratch: Vec::new(),
        })
    }
}

impl VadEngine for WebRtcVadEngine {
    fn is_speech(&mut self, frame: &[u8], _sample_rate: u32) -> bool {
        self.scratch.clear();
        self.scratch.extend(
            frame
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        self.vad.is_voice_segment(&self.scratch).unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::VadEngine;

    /// Replays a fixed decision script, then stays silent.
    pub struct ScriptedVad {
        decisions: Vec<bool>,
        cursor: usize,
    }

    impl ScriptedVad {
        pub fn new(decisions: Vec<bool>) -> Self {
            Self {
                decisions,
                cursor: 0,
            }
        }
    }

    impl VadEngine for ScriptedVad {
        fn is_speech(&mut self, _frame: &[u8], _sample_rate: u32) -> bool {
            let decision = self.decisions.get(self.cursor).copied().unwrap_or(false);
            self.cursor += 1;
            decision
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_aggressiveness() {
        assert!(WebRtcVadEngine::new(16_000, 4).is_err());
        assert!(WebRtcVadEngine::new(16_000, 3).is_ok());
    }

    #[test]
    fn rejects_bad_sample_rate() {
        assert!(WebRtcVadEngine::new(44_100, 2).is_err());
    }

    #[test]
    fn silence_is_not_speech() {
        let mut engine = WebRtcVadEngine::new(16_000, 2).unwrap();
        let silence = vec![0u8; 960]; // 30 ms at 16 kHz
        assert!(!engine.is_speech(&silence, 16_000));
    }
}
