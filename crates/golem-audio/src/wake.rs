//! Wake word detection.
//!
//! Frames from the capture path are scored through a windowed inference
//! gate. Scoring runs either through an ONNX model (feature `onnx-wake`,
//! via tract) or an energy-based fallback; on top sits the debounce state
//! machine: rising-edge detection, refractory gap, post-TTS suppression
//! and low-score rearm.

use crate::error::Result;
use crate::input::Microphone;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inference chunk granularity: 80 ms at 16 kHz.
const CHUNK_SAMPLES: usize = 1280;

/// Wake gate parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WakeConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_win_ms")]
    pub win_ms: u32,
    #[serde(default = "default_hop_ms")]
    pub hop_ms: u32,
    #[serde(default = "default_min_gap_s")]
    pub min_gap_s: f64,
    #[serde(default = "default_suppress_after_tts_s")]
    pub suppress_after_tts_s: f64,
    #[serde(default = "default_rearm_ratio")]
    pub rearm_ratio: f32,
    #[serde(default = "default_rearm_low_count")]
    pub rearm_low_count: u32,
    /// Optional ONNX model path for the `onnx-wake` feature.
    #[serde(default)]
    pub model_path: Option<std::path::PathBuf>,
}

fn default_threshold() -> f32 {
    0.3
}
fn default_win_ms() -> u32 {
    800
}
fn default_hop_ms() -> u32 {
    160
}
fn default_min_gap_s() -> f64 {
    1.5
}
fn default_suppress_after_tts_s() -> f64 {
    0.8
}
fn default_rearm_ratio() -> f32 {
    0.6
}
fn default_rearm_low_count() -> u32 {
    3
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            win_ms: default_win_ms(),
            hop_ms: default_hop_ms(),
            min_gap_s: default_min_gap_s(),
            suppress_after_tts_s: default_suppress_after_tts_s(),
            rearm_ratio: default_rearm_ratio(),
            rearm_low_count: default_rearm_low_count(),
            model_path: None,
        }
    }
}

/// A detected wake, surfaced once per rearmed cycle.
#[derive(Debug, Clone, Copy)]
pub struct WakeEvent {
    pub detected_at: Instant,
    pub confidence: f32,
}

/// Scores one analysis window for wake-word presence.
pub trait WakeScorer: Send {
    /// Score in [0, 1] for the PCM16 window.
    fn score(&mut self, window: &[i16]) -> Result<f32>;

    /// Clear any internal model state.
    fn reset(&mut self) {}
}

/// Energy-based fallback scorer (no model required).
#[derive(Default)]
pub struct EnergyScorer;

impl WakeScorer for EnergyScorer {
    fn score(&mut self, window: &[i16]) -> Result<f32> {
        if window.is_empty() {
            return Ok(0.0);
        }
        let sum: f64 = window
            .iter()
            .map(|s| {
                let x = f64::from(*s) / 32_768.0;
                x * x
            })
            .sum();
        let rms = (sum / window.len() as f64).sqrt() as f32;
        Ok((rms * 2.0).min(1.0))
    }
}

#[cfg(feature = "onnx-wake")]
mod onnx {
    //! ONNX wake-word scorer via tract.

    use super::{WakeScorer, CHUNK_SAMPLES};
    use crate::error::{AudioError, Result};
    use std::path::Path;
    use tract_onnx::prelude::*;

    type WakeModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

    /// Wake-word model loaded via tract-onnx.
    pub struct OnnxScorer {
        model: WakeModel,
        window_samples: usize,
    }

    impl OnnxScorer {
        /// Load the model for a fixed analysis window length.
        pub fn load(model_path: &Path, window_samples: usize) -> Result<Self> {
            let model = tract_onnx::onnx()
                .model_for_path(model_path)
                .map_err(|e| AudioError::Wake(format!("model load: {e}")))?
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec![1, window_samples as i64]),
                )
                .map_err(|e| AudioError::Wake(format!("input fact: {e}")))?
                .into_optimized()
                .map_err(|e| AudioError::Wake(format!("model optimize: {e}")))?
                .into_runnable()
                .map_err(|e| AudioError::Wake(format!("model runnable: {e}")))?;
            tracing::info!(path = %model_path.display(), "wake model loaded");
            Ok(Self {
                model,
                window_samples,
            })
        }
    }

    impl WakeScorer for OnnxScorer {
        fn score(&mut self, window: &[i16]) -> Result<f32> {
            // Round down to whole 80 ms chunks, as the model was trained on.
            let n = (window.len() / CHUNK_SAMPLES) * CHUNK_SAMPLES;
            if n == 0 {
                return Ok(0.0);
            }
            let mut input = vec![0.0f32; self.window_samples];
            let offset = self.window_samples.saturating_sub(n);
            for (slot, sample) in input[offset..].iter_mut().zip(&window[window.len() - n..]) {
                *slot = f32::from(*sample) / 32_768.0;
            }
            let tensor: Tensor =
                tract_ndarray::Array2::from_shape_vec((1, self.window_samples), input)
                    .map_err(|e| AudioError::Wake(format!("input tensor: {e}")))?
                    .into();
            let outputs = self
                .model
                .run(tvec![tensor.into()])
                .map_err(|e| AudioError::Wake(format!("inference: {e}")))?;
            let score = outputs[0]
                .to_array_view::<f32>()
                .map_err(|e| AudioError::Wake(format!("output parse: {e}")))?
                .iter()
                .next()
                .copied()
                .unwrap_or(0.0);
            Ok(score.clamp(0.0, 1.0))
        }
    }
}

#[cfg(feature = "onnx-wake")]
pub use onnx::OnnxScorer;

/// Windowed wake gate with debounce and rearm.
pub struct WakeWordDetector {
    config: WakeConfig,
    scorer: Box<dyn WakeScorer>,
    ring: Vec<i16>,
    hop_samples: usize,
    armed: bool,
    was_above: bool,
    below_consec: u32,
    last_wake: Option<Instant>,
    suppress_until: Option<Instant>,
}

impl WakeWordDetector {
    /// Build a detector with an explicit scorer.
    #[must_use]
    pub fn new(config: WakeConfig, sample_rate: u32, scorer: Box<dyn WakeScorer>) -> Self {
        let win_samples = snap_to_chunks(sample_rate, config.win_ms);
        let hop_samples = snap_to_chunks(sample_rate, config.hop_ms);
        info!(
            win_samples,
            hop_samples,
            threshold = config.threshold,
            "wake detector ready"
        );
        Self {
            config,
            scorer,
            ring: vec![0; win_samples],
            hop_samples,
            armed: true,
            was_above: false,
            below_consec: 0,
            last_wake: None,
            suppress_until: None,
        }
    }

    /// Detector with the energy fallback scorer.
    #[must_use]
    pub fn with_energy_fallback(config: WakeConfig, sample_rate: u32) -> Self {
        Self::new(config, sample_rate, Box::new(EnergyScorer))
    }

    /// Detector backed by the ONNX model from the config.
    #[cfg(feature = "onnx-wake")]
    pub fn with_onnx(config: WakeConfig, sample_rate: u32) -> Result<Self> {
        let path = config.model_path.clone().ok_or_else(|| {
            crate::error::AudioError::Wake("no wake model path configured".to_string())
        })?;
        let win_samples = snap_to_chunks(sample_rate, config.win_ms);
        let scorer = onnx::OnnxScorer::load(&path, win_samples)?;
        Ok(Self::new(config, sample_rate, Box::new(scorer)))
    }

    /// Samples consumed per detection hop.
    #[must_use]
    pub fn hop_samples(&self) -> usize {
        self.hop_samples
    }

    /// Feed one hop of samples and run the debounce state machine.
    pub fn push(&mut self, samples: &[f32]) -> Result<Option<WakeEvent>> {
        self.roll_ring(samples);
        let score = self.scorer.score(&self.ring)?;
        let now = Instant::now();

        if score <= self.config.threshold * self.config.rearm_ratio {
            self.below_consec += 1;
        } else {
            self.below_consec = 0;
        }

        if let Some(until) = self.suppress_until {
            if now < until {
                self.was_above = score >= self.config.threshold;
                return Ok(None);
            }
            self.suppress_until = None;
        }

        if !self.armed {
            if self.below_consec >= self.config.rearm_low_count {
                self.armed = true;
                debug!("wake detector rearmed");
            }
            self.was_above = score >= self.config.threshold;
            if !self.armed {
                return Ok(None);
            }
        }

        if score >= self.config.threshold && !self.was_above {
            if let Some(last) = self.last_wake {
                if now.duration_since(last) < Duration::from_secs_f64(self.config.min_gap_s) {
                    self.was_above = true;
                    return Ok(None);
                }
            }
            self.last_wake = Some(now);
            self.armed = false;
            self.suppress_until =
                Some(now + Duration::from_secs_f64(self.config.min_gap_s));
            self.was_above = true;
            debug!(score, "wake fired");
            return Ok(Some(WakeEvent {
                detected_at: now,
                confidence: score,
            }));
        }

        self.was_above = score >= self.config.threshold;
        Ok(None)
    }

    /// Read one hop from the mic and report a raw above-threshold score.
    ///
    /// This is the non-blocking barge-in probe: no debounce, no rearm
    /// bookkeeping beyond the ring update.
    pub fn check_once(&mut self, mic: &dyn Microphone) -> Result<bool> {
        let samples = mic.read_samples(self.hop_samples)?;
        self.roll_ring(&samples);
        let score = self.scorer.score(&self.ring)?;
        Ok(score >= self.config.threshold)
    }

    /// Block until a wake fires or the stop flag rises.
    pub fn wait(
        &mut self,
        mic: &dyn Microphone,
        stop: &std::sync::atomic::AtomicBool,
    ) -> Result<Option<WakeEvent>> {
        while !stop.load(std::sync::atomic::Ordering::SeqCst) {
            let samples = mic.read_samples(self.hop_samples)?;
            if let Some(event) = self.push(&samples)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Clear ring and debounce state; the detector comes back armed.
    pub fn reset(&mut self) {
        self.ring.fill(0);
        self.below_consec = 0;
        self.was_above = false;
        self.armed = true;
        self.suppress_until = None;
        self.scorer.reset();
    }

    /// Rearm immediately but suppress detection for the post-TTS window,
    /// so the speaker tail cannot self-trigger.
    pub fn reset_after_tts(&mut self) {
        self.reset();
        self.suppress_until =
            Some(Instant::now() + Duration::from_secs_f64(self.config.suppress_after_tts_s));
    }

    fn roll_ring(&mut self, samples: &[f32]) {
        let incoming: Vec<i16> = samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
            .collect();
        let keep = self.ring.len().saturating_sub(incoming.len());
        let ring_len = self.ring.len();
        self.ring.copy_within(ring_len - keep.., 0);
        let tail = incoming.len().min(self.ring.len());
        let start = self.ring.len() - tail;
        self.ring[start..].copy_from_slice(&incoming[incoming.len() - tail..]);
    }
}

fn snap_to_chunks(sample_rate: u32, window_ms: u32) -> usize {
    let samples = (sample_rate as usize * window_ms as usize) / 1000;
    ((samples / CHUNK_SAMPLES) * CHUNK_SAMPLES).max(CHUNK_SAMPLES)
}
