//! Daemon configuration.
//!
//! One immutable [`AppConfig`] assembled at startup from an optional TOML
//! file plus `GOLEM_*` environment overrides (double underscore as the
//! section separator, e.g. `GOLEM_WAKE__THRESHOLD=0.4`). The servo
//! calibration overlay is loaded separately and applied by the registry.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use golem_audio::{EndpointConfig, RecorderConfig, WakeConfig};
use golem_servo::{AnimationConfig, EyelidConfig};
use golem_services::{
    FifoTtsConfig, LlmConfig, MqttTtsConfig, SpeakerConfig, SttConfig, SubprocessTtsConfig,
};
use golem_vision::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: RecorderConfig,
    pub endpoint: EndpointConfig,
    pub wake: WakeConfig,
    pub dialogue: DialogueConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsSection,
    pub vision: VisionSection,
    pub tracker: TrackerConfig,
    pub servo: ServoSection,
    pub eyelid: EyelidConfig,
    pub animation: AnimationConfig,
}

/// Dialogue state machine tuning and phrases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    pub followup_enable: bool,
    pub followup_arm_s: f64,
    /// 0 means unlimited follow-up turns.
    pub followup_max_turns: u32,
    pub followup_cooldown_s: f64,
    pub barge_in: bool,
    pub cooldown_after_tts_s: f64,
    pub deep_sleep_timeout_s: f64,
    pub reset_on_wake: bool,
    pub ctx_turns: usize,
    pub system_prompt: String,
    pub confirm_phrase: String,
    pub ready_phrase: String,
    pub goodbye_phrase: String,
    pub end_of_conversation_phrase: String,
    pub nap_phrase: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            followup_enable: true,
            followup_arm_s: 3.0,
            followup_max_turns: 0,
            followup_cooldown_s: 0.10,
            barge_in: true,
            cooldown_after_tts_s: 0.5,
            deep_sleep_timeout_s: 300.0,
            reset_on_wake: true,
            ctx_turns: 6,
            system_prompt: String::new(),
            confirm_phrase: "Yes?".to_string(),
            ready_phrase: "All subsystems ready. I am waiting for the wake word.".to_string(),
            goodbye_phrase: "Goodbye!".to_string(),
            end_of_conversation_phrase: "Alright, I'll wait for the wake word.".to_string(),
            nap_phrase: "Taking a nap. Wake me with the wake word.".to_string(),
        }
    }
}

/// TTS transport selection and per-backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSection {
    /// Preferred backend: `mqtt`, `fifo` or `subprocess`. The others stay
    /// registered as fallbacks in that order.
    pub mode: String,
    pub mqtt: MqttTtsConfig,
    pub fifo: FifoTtsConfig,
    pub subprocess: SubprocessTtsConfig,
    pub speaker: SpeakerConfig,
}

impl Default for TtsSection {
    fn default() -> Self {
        Self {
            mode: "mqtt".to_string(),
            mqtt: MqttTtsConfig::default(),
            fifo: FifoTtsConfig::default(),
            subprocess: SubprocessTtsConfig::default(),
            speaker: SpeakerConfig::default(),
        }
    }
}

/// Camera-side detector link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionSection {
    pub enabled: bool,
    pub serial_port: String,
    pub baud_rate: u32,
    /// Hand the head-roll servo to the tracker for horizontal yaw.
    /// Off by default: base rotation is done by the wheels.
    pub yaw_enabled: bool,
}

impl Default for VisionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            serial_port: "/dev/ttyACM0".to_string(),
            baud_rate: 921_600,
            yaw_enabled: false,
        }
    }
}

/// PWM expander settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoSection {
    /// `pca9685` for hardware, `mock` for bench runs without the hat.
    pub backend: String,
    pub i2c_bus: u8,
    pub i2c_address: u16,
    pub pwm_freq_hz: f64,
    pub calibration_path: PathBuf,
}

impl Default for ServoSection {
    fn default() -> Self {
        Self {
            backend: "pca9685".to_string(),
            i2c_bus: 1,
            i2c_address: 0x40,
            pwm_freq_hz: 50.0,
            calibration_path: PathBuf::from("servo-calibration.json"),
        }
    }
}

impl AppConfig {
    /// Load from `$GOLEM_CONFIG` (default `golem.toml`) plus environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("GOLEM_CONFIG").unwrap_or_else(|_| "golem".to_string());
        let raw = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("GOLEM").separator("__"))
            .build()
            .context("failed to assemble configuration")?;
        raw.try_deserialize()
            .context("configuration did not match the expected schema")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_field_manual() {
        let config = AppConfig::default();
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.endpoint.frame_ms, 30);
        assert_eq!(config.endpoint.start_win, 5);
        assert!((config.wake.threshold - 0.3).abs() < 1e-6);
        assert!((config.dialogue.followup_arm_s - 3.0).abs() < 1e-9);
        assert_eq!(config.dialogue.followup_max_turns, 0);
        assert!(config.dialogue.barge_in);
        assert!((config.dialogue.deep_sleep_timeout_s - 300.0).abs() < 1e-9);
        assert_eq!(config.tts.mode, "mqtt");
        assert_eq!(config.servo.i2c_address, 0x40);
    }

    #[test]
    fn json_round_trip_preserves_defaults() {
        let config = AppConfig::default();
        let rendered = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.endpoint.start_win, config.endpoint.start_win);
        assert_eq!(parsed.tts.mode, config.tts.mode);
    }
}
