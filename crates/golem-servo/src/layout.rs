//! Fixed servo layout and pose presets.
//!
//! The mechanics bind ten actuators to PWM channels 0-9:
//!
//! ```text
//!   0: EYL (left eye)        5: MOU (mouth)
//!   1: EYR (right eye)       6: EAL (left ear)
//!   2: LID (eyelid)          7: EAR (right ear)
//!   3: NPT (head pitch)      8: LWH (left wheel)
//!   4: NRL (head roll)       9: RWH (right wheel)
//! ```

use crate::servo::ServoConfig;

/// Servos the face tracker drives.
pub const TRACKING_SERVOS: &[&str] = &["EYL", "EYR", "NPT", "LWH", "RWH"];

/// Servos owned by the personality animation loops.
pub const PERSONALITY_SERVOS: &[&str] = &["NRL", "MOU", "EAL", "EAR"];

/// One entry of the mechanical layout.
#[derive(Debug, Clone)]
pub struct ServoDefinition {
    pub name: &'static str,
    pub channel: u8,
    pub config: ServoConfig,
}

fn definition(
    name: &'static str,
    channel: u8,
    min_angle: f64,
    max_angle: f64,
    max_speed: f64,
    max_accel: f64,
    deadzone: f64,
    neutral: f64,
) -> ServoDefinition {
    ServoDefinition {
        name,
        channel,
        config: ServoConfig {
            min_angle_deg: min_angle,
            max_angle_deg: max_angle,
            min_pulse_us: 600.0,
            max_pulse_us: 2400.0,
            max_speed_deg_per_s: max_speed,
            max_accel_deg_per_s2: max_accel,
            deadzone_deg: deadzone,
            neutral_deg: neutral,
            invert: false,
            pwm_freq_hz: 50.0,
        },
    }
}

/// The v1 mechanical layout with per-servo default configs.
#[must_use]
pub fn layout_v1() -> Vec<ServoDefinition> {
    vec![
        definition("EYL", 0, -38.0, 64.0, 200.0, 1000.0, 0.8, 20.0),
        definition("EYR", 1, -6.0, 90.0, 250.0, 1000.0, 0.8, 40.0),
        definition("LID", 2, -90.0, 59.0, 50_000.0, 50_000.0, 1.0, -15.0),
        definition("NPT", 3, 10.0, 34.0, 600.0, 400.0, 1.0, 10.0),
        definition("NRL", 4, -32.0, 68.0, 600.0, 400.0, 1.2, 6.0),
        definition("MOU", 5, -31.0, 88.0, 50_000.0, 10_000.0, 1.0, 88.0),
        definition("EAL", 6, -38.0, 9.0, 250.0, 200.0, 1.0, -20.0),
        definition("EAR", 7, -61.0, 20.0, 500.0, 200.0, 1.0, 0.0),
        definition("LWH", 8, -90.0, 90.0, 100.0, 25.0, 1.0, 0.0),
        definition("RWH", 9, -90.0, 90.0, 100.0, 25.0, 1.0, 0.0),
    ]
}

/// Resting pose for the personality servos.
pub const POSE_REST: &[(&str, f64)] = &[
    ("NRL", 6.0),
    ("MOU", 88.0),
    ("LID", -15.0),
    ("EAL", -20.0),
    ("EAR", 0.0),
];

/// Attentive pose used while listening.
pub const POSE_CURIOUS: &[(&str, f64)] = &[
    ("NRL", -10.0),
    ("MOU", 70.0),
    ("LID", 10.0),
    ("EAL", -30.0),
    ("EAR", -10.0),
];

/// Pondering pose used by the thinking animation.
pub const POSE_THINKING: &[(&str, f64)] = &[
    ("NRL", 30.0),
    ("MOU", 60.0),
    ("LID", -40.0),
    ("EAL", -10.0),
    ("EAR", 10.0),
];

/// Look up a pose; unknown names fall back to the resting pose.
#[must_use]
pub fn pose(name: &str) -> &'static [(&'static str, f64)] {
    match name {
        "curious" => POSE_CURIOUS,
        "thinking" => POSE_THINKING,
        _ => POSE_REST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_dense_and_unique() {
        let layout = layout_v1();
        assert_eq!(layout.len(), 10);
        for (index, def) in layout.iter().enumerate() {
            assert_eq!(def.channel as usize, index);
            assert!(def.config.validate().is_ok(), "{} invalid", def.name);
        }
    }

    #[test]
    fn tracking_and_personality_sets_are_disjoint() {
        for name in TRACKING_SERVOS {
            assert!(!PERSONALITY_SERVOS.contains(name));
        }
    }

    #[test]
    fn unknown_pose_falls_back_to_rest() {
        assert_eq!(pose("nonsense"), POSE_REST);
        assert_eq!(pose("curious"), POSE_CURIOUS);
    }

    #[test]
    fn poses_stay_within_layout_limits() {
        let layout = layout_v1();
        for pose_name in ["rest", "curious", "thinking"] {
            for (servo, angle) in pose(pose_name) {
                let def = layout.iter().find(|d| d.name == *servo).unwrap();
                assert!(*angle >= def.config.min_angle_deg);
                assert!(*angle <= def.config.max_angle_deg);
            }
        }
    }
}
