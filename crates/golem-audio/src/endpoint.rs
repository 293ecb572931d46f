//! Speech endpointing.
//!
//! Wraps the microphone with a frame-exact start/end state machine:
//! majority-vote start detection with a consecutive-speech requirement,
//! preroll so the first syllable is not clipped, hangover-based end
//! detection and guard/absolute caps.

use crate::error::Result;
use crate::input::Microphone;
use crate::vad::{VadEngine, WebRtcVadEngine};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Endpointing parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default = "default_vad_aggressiveness")]
    pub vad_aggressiveness: u8,
    #[serde(default = "default_start_win")]
    pub start_win: usize,
    #[serde(default = "default_start_min")]
    pub start_min: usize,
    #[serde(default = "default_start_consec_min")]
    pub start_consec_min: usize,
    #[serde(default = "default_end_hang_ms")]
    pub end_hang_ms: u32,
    #[serde(default = "default_end_guard_ms")]
    pub end_guard_ms: u32,
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u32,
    #[serde(default = "default_no_speech_timeout_s")]
    pub no_speech_timeout_s: f64,
    #[serde(default = "default_max_utter_s")]
    pub max_utter_s: f64,
}

fn default_frame_ms() -> u32 {
    30
}
fn default_vad_aggressiveness() -> u8 {
    2
}
fn default_start_win() -> usize {
    5
}
fn default_start_min() -> usize {
    3
}
fn default_start_consec_min() -> usize {
    3
}
fn default_end_hang_ms() -> u32 {
    250
}
fn default_end_guard_ms() -> u32 {
    1200
}
fn default_preroll_ms() -> u32 {
    240
}
fn default_no_speech_timeout_s() -> f64 {
    3.0
}
fn default_max_utter_s() -> f64 {
    8.0
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_frame_ms(),
            vad_aggressiveness: default_vad_aggressiveness(),
            start_win: default_start_win(),
            start_min: default_start_min(),
            start_consec_min: default_start_consec_min(),
            end_hang_ms: default_end_hang_ms(),
            end_guard_ms: default_end_guard_ms(),
            preroll_ms: default_preroll_ms(),
            no_speech_timeout_s: default_no_speech_timeout_s(),
            max_utter_s: default_max_utter_s(),
        }
    }
}

/// Why a recording ended. Control-flow signals, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOutcome {
    /// Hangover elapsed after speech; the normal case.
    SpeechEnded,
    /// Nothing said within the arm window.
    NoSpeech,
    /// Speech ran into the absolute utterance cap.
    MaxUtterance,
    /// The shared stop flag was raised mid-recording.
    Cancelled,
}

/// One recorded utterance.
#[derive(Debug)]
pub struct Utterance {
    /// Contiguous PCM16 audio, preroll included.
    pub audio: Vec<u8>,
    pub outcome: EndpointOutcome,
}

impl Utterance {
    /// Audio length in seconds at the given sample rate.
    #[must_use]
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.audio.len() as f64 / (2.0 * f64::from(sample_rate))
    }
}

/// The endpointing state machine.
pub struct SpeechEndpoint {
    config: EndpointConfig,
    sample_rate: u32,
    frame_bytes: usize,
    hang_frames: usize,
    preroll_frames: usize,
    end_guard: Duration,
}

impl SpeechEndpoint {
    /// Derive the frame sizes from the configuration.
    #[must_use]
    pub fn new(sample_rate: u32, mut config: EndpointConfig) -> Self {
        if !matches!(config.frame_ms, 10 | 20 | 30) {
            config.frame_ms = default_frame_ms();
        }
        let frame_samples = (sample_rate * config.frame_ms / 1000) as usize;
        let hang_frames = (config.end_hang_ms as f64 / f64::from(config.frame_ms)).ceil() as usize;
        Self {
            sample_rate,
            frame_bytes: frame_samples * 2,
            hang_frames: hang_frames.max(1),
            preroll_frames: (config.preroll_ms / config.frame_ms) as usize,
            end_guard: Duration::from_millis(u64::from(config.end_guard_ms)),
            config,
        }
    }

    /// Byte length of one VAD frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Record one utterance using the production WebRTC VAD.
    pub fn record(
        &self,
        mic: &dyn Microphone,
        no_speech_timeout: Option<Duration>,
        stop: &AtomicBool,
    ) -> Result<Utterance> {
        let mut vad = WebRtcVadEngine::new(self.sample_rate, self.config.vad_aggressiveness)?;
        self.record_with(mic, &mut vad, no_speech_timeout, stop)
    }

    /// Record with a caller-supplied VAD engine.
    ///
    /// Given a frozen engine and a replayed PCM stream, the returned bytes
    /// and outcome are identical run to run.
    pub fn record_with(
        &self,
        mic: &dyn Microphone,
        vad: &mut dyn VadEngine,
        no_speech_timeout: Option<Duration>,
        stop: &AtomicBool,
    ) -> Result<Utterance> {
        let timeout = no_speech_timeout
            .unwrap_or_else(|| Duration::from_secs_f64(self.config.no_speech_timeout_s));
        let max_utter = Duration::from_secs_f64(self.config.max_utter_s);

        let mut votes: VecDeque<u8> = VecDeque::with_capacity(self.config.start_win);
        let mut preroll: VecDeque<Vec<u8>> = VecDeque::with_capacity(self.preroll_frames);
        let mut audio: Vec<u8> = Vec::new();

        let armed_at = Instant::now();
        let mut started_at: Option<Instant> = None;
        let mut consec_speech = 0usize;
        let mut frames_since_voice = 0usize;

        loop {
            if stop.load(Ordering::SeqCst) {
                debug!("endpoint cancelled");
                return Ok(Utterance {
                    audio,
                    outcome: EndpointOutcome::Cancelled,
                });
            }

            let now = Instant::now();
            match started_at {
                None => {
                    if now.duration_since(armed_at) > timeout {
                        return Ok(Utterance {
                            audio,
                            outcome: EndpointOutcome::NoSpeech,
                        });
                    }
                }
                Some(start) => {
                    if now.duration_since(start) > max_utter {
                        debug!("utterance hit the absolute cap");
                        return Ok(Utterance {
                            audio,
                            outcome: EndpointOutcome::MaxUtterance,
                        });
                    }
                }
            }

            let frame = mic.read_bytes(self.frame_bytes)?;
            let is_speech = vad.is_speech(&frame, self.sample_rate);

            match started_at {
                None => {
                    if votes.len() == self.config.start_win {
                        votes.pop_front();
                    }
                    votes.push_back(u8::from(is_speech));
                    consec_speech = if is_speech { consec_speech + 1 } else { 0 };

                    let speech_votes: usize =
                        votes.iter().map(|v| usize::from(*v)).sum();
                    if votes.len() == self.config.start_win
                        && speech_votes >= self.config.start_min
                        && consec_speech >= self.config.start_consec_min
                    {
                        // Start trigger: prior frames first, then this one.
                        for prior in preroll.drain(..) {
                            audio.extend(prior);
                        }
                        audio.extend(&frame);
                        started_at = Some(now);
                        frames_since_voice = 0;
                        debug!("speech started");
                    } else if self.preroll_frames > 0 {
                        if preroll.len() == self.preroll_frames {
                            preroll.pop_front();
                        }
                        preroll.push_back(frame);
                    }
                }
                Some(start) => {
                    audio.extend(&frame);
                    if is_speech {
                        frames_since_voice = 0;
                    } else {
                        frames_since_voice += 1;
                        if frames_since_voice >= self.hang_frames
                            && now.duration_since(start) >= self.end_guard
                        {
                            debug!(
                                secs = audio.len() as f64 / (2.0 * f64::from(self.sample_rate)),
                                "speech ended"
                            );
                            return Ok(Utterance {
                                audio,
                                outcome: EndpointOutcome::SpeechEnded,
                            });
                        }
                    }
                }
            }
        }
    }
}
