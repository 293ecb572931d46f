//! Servo calibration overlay.
//!
//! A calibration file narrows the mechanical range of individual channels
//! and records the launch/park angles measured on the assembled head. The
//! overlay only ever tightens the configured limits.

use crate::error::{Result, ServoError};
use crate::servo::ServoConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Reference frame of the calibration rig: -90 deg maps to 500 us,
/// +90 deg to 2500 us.
const REF_MIN_ANGLE: f64 = -90.0;
const REF_MAX_ANGLE: f64 = 90.0;
const REF_MIN_PULSE: f64 = 500.0;
const REF_MAX_PULSE: f64 = 2500.0;

/// Measured limits and rest angles for one channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServoCalibration {
    pub channel: u8,
    pub min_deg: f64,
    pub max_deg: f64,
    pub start_deg: f64,
    #[serde(default)]
    pub stop_deg: Option<f64>,
}

impl ServoCalibration {
    /// Launch neutral, clamped into the calibrated range.
    #[must_use]
    pub fn clamped_start(&self) -> f64 {
        self.start_deg.clamp(self.min_deg, self.max_deg)
    }

    /// Park angle for shutdown; falls back to the start angle.
    #[must_use]
    pub fn clamped_stop(&self) -> f64 {
        self.stop_deg
            .unwrap_or(self.start_deg)
            .clamp(self.min_deg, self.max_deg)
    }
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    #[serde(default)]
    servos: Vec<serde_json::Value>,
}

/// Load the calibration map from a JSON file.
///
/// Missing files yield an empty map; malformed entries are skipped with a
/// warning so one bad channel never takes down startup.
pub fn load_calibration(path: &Path) -> Result<HashMap<u8, ServoCalibration>> {
    let mut map = HashMap::new();
    if !path.is_file() {
        info!(path = %path.display(), "no servo calibration file, using layout defaults");
        return Ok(map);
    }
    let text = std::fs::read_to_string(path)?;
    let file: CalibrationFile = serde_json::from_str(&text)
        .map_err(|e| ServoError::Calibration(format!("{}: {e}", path.display())))?;

    for raw in file.servos {
        let entry: ServoCalibration = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%raw, error = %e, "ignoring invalid calibration entry");
                continue;
            }
        };
        if entry.min_deg >= entry.max_deg {
            warn!(
                channel = entry.channel,
                min = entry.min_deg,
                max = entry.max_deg,
                "ignoring calibration with inverted range"
            );
            continue;
        }
        map.insert(entry.channel, entry);
    }
    info!(
        path = %path.display(),
        channels = ?{
            let mut keys: Vec<u8> = map.keys().copied().collect();
            keys.sort_unstable();
            keys
        },
        "servo calibration loaded"
    );
    Ok(map)
}

/// Apply a calibration overlay to a base config.
///
/// The calibrated range is intersected with the configured one (tighten,
/// never widen) and the pulse limits are remapped so the calibration rig's
/// reference frame stays valid: a degree keeps meaning the same pulse.
#[must_use]
pub fn apply_calibration(base: &ServoConfig, calibration: &ServoCalibration) -> ServoConfig {
    let min_deg = calibration.min_deg.max(base.min_angle_deg);
    let max_deg = calibration.max_deg.min(base.max_angle_deg);

    let us_per_deg = (REF_MAX_PULSE - REF_MIN_PULSE) / (REF_MAX_ANGLE - REF_MIN_ANGLE);
    let angle_to_pulse = |angle: f64| REF_MIN_PULSE + (angle - REF_MIN_ANGLE) * us_per_deg;

    ServoConfig {
        min_angle_deg: min_deg,
        max_angle_deg: max_deg,
        min_pulse_us: angle_to_pulse(min_deg),
        max_pulse_us: angle_to_pulse(max_deg),
        neutral_deg: calibration.clamped_start().clamp(min_deg, max_deg),
        ..base.clone()
    }
}

/// Merge an optional calibration into the env/layout config.
#[must_use]
pub fn merge_calibration(base: &ServoConfig, calibration: Option<&ServoCalibration>) -> ServoConfig {
    match calibration {
        Some(cal) => apply_calibration(base, cal),
        None => base.clone(),
    }
}
