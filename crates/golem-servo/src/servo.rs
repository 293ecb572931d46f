//! Motion-profile limited servo on one PWM channel.

use crate::bus::SharedBus;
use crate::error::{Result, ServoError};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Configurable parameters for one actuator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServoConfig {
    pub min_angle_deg: f64,
    pub max_angle_deg: f64,
    pub min_pulse_us: f64,
    pub max_pulse_us: f64,
    pub max_speed_deg_per_s: f64,
    pub max_accel_deg_per_s2: f64,
    pub deadzone_deg: f64,
    pub neutral_deg: f64,
    pub invert: bool,
    pub pwm_freq_hz: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            min_angle_deg: -90.0,
            max_angle_deg: 90.0,
            min_pulse_us: 500.0,
            max_pulse_us: 2500.0,
            max_speed_deg_per_s: 360.0,
            max_accel_deg_per_s2: 720.0,
            deadzone_deg: 0.5,
            neutral_deg: 0.0,
            invert: false,
            pwm_freq_hz: 50.0,
        }
    }
}

impl ServoConfig {
    /// Validate the range and limit invariants.
    pub fn validate(&self) -> Result<()> {
        if self.min_angle_deg >= self.max_angle_deg {
            return Err(ServoError::Config(format!(
                "min_angle_deg {} must be below max_angle_deg {}",
                self.min_angle_deg, self.max_angle_deg
            )));
        }
        if self.min_pulse_us >= self.max_pulse_us {
            return Err(ServoError::Config(format!(
                "min_pulse_us {} must be below max_pulse_us {}",
                self.min_pulse_us, self.max_pulse_us
            )));
        }
        if self.max_speed_deg_per_s <= 0.0 {
            return Err(ServoError::Config("max_speed_deg_per_s must be positive".into()));
        }
        if self.max_accel_deg_per_s2 <= 0.0 {
            return Err(ServoError::Config("max_accel_deg_per_s2 must be positive".into()));
        }
        if self.deadzone_deg < 0.0 {
            return Err(ServoError::Config("deadzone_deg must not be negative".into()));
        }
        if self.pwm_freq_hz <= 0.0 {
            return Err(ServoError::Config("pwm_freq_hz must be positive".into()));
        }
        if self.neutral_deg < self.min_angle_deg || self.neutral_deg > self.max_angle_deg {
            return Err(ServoError::Config(format!(
                "neutral_deg {} outside [{}, {}]",
                self.neutral_deg, self.min_angle_deg, self.max_angle_deg
            )));
        }
        Ok(())
    }

    fn clamp_angle(&self, angle: f64) -> f64 {
        angle.clamp(self.min_angle_deg, self.max_angle_deg)
    }
}

#[derive(Debug)]
struct MotionState {
    angle_deg: f64,
    velocity_deg_per_s: f64,
    target_deg: f64,
    last_pulse_us: Option<f64>,
    last_tick: Option<Instant>,
}

/// One physical actuator behind the shared PWM bus.
///
/// All mutation goes through the internal mutex, so `Arc<Servo>` handles
/// can be shared by the tracker, the eyelid controller and the animation
/// loops; each writer only touches its own disjoint servo set.
pub struct Servo {
    name: String,
    channel: u8,
    config: ServoConfig,
    bus: SharedBus,
    state: Mutex<MotionState>,
}

impl Servo {
    /// Create a servo and drive it to its neutral angle.
    pub fn new(name: impl Into<String>, channel: u8, config: ServoConfig, bus: SharedBus) -> Result<Self> {
        config.validate()?;
        let neutral = Self::command_angle(&config, config.neutral_deg);
        let servo = Self {
            name: name.into(),
            channel,
            state: Mutex::new(MotionState {
                angle_deg: neutral,
                velocity_deg_per_s: 0.0,
                target_deg: neutral,
                last_pulse_us: None,
                last_tick: None,
            }),
            config,
            bus,
        };
        servo.write_current_pulse()?;
        Ok(servo)
    }

    /// Servo name from the layout (e.g. `MOU`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PWM channel this servo is bound to.
    #[must_use]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Configuration, immutable after construction.
    #[must_use]
    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    /// Current angle in degrees.
    #[must_use]
    pub fn angle(&self) -> f64 {
        self.state.lock().expect("servo state").angle_deg
    }

    /// Current angular velocity in deg/s.
    #[must_use]
    pub fn velocity(&self) -> f64 {
        self.state.lock().expect("servo state").velocity_deg_per_s
    }

    /// Current target angle.
    #[must_use]
    pub fn target(&self) -> f64 {
        self.state.lock().expect("servo state").target_deg
    }

    /// Whether the servo has converged on its target.
    #[must_use]
    pub fn is_settled(&self, epsilon_deg: f64) -> bool {
        let state = self.state.lock().expect("servo state");
        (state.target_deg - state.angle_deg).abs() <= epsilon_deg
    }

    fn command_angle(config: &ServoConfig, raw_deg: f64) -> f64 {
        let clamped = config.clamp_angle(raw_deg);
        if config.invert {
            config.max_angle_deg - (clamped - config.min_angle_deg)
        } else {
            clamped
        }
    }

    /// Set a new target angle.
    ///
    /// The raw angle is clamped to the allowed range and mirrored when the
    /// servo is inverted. A change smaller than the deadzone is ignored and
    /// the previous target kept.
    pub fn set_target(&self, raw_deg: f64) {
        let target = Self::command_angle(&self.config, raw_deg);
        let mut state = self.state.lock().expect("servo state");
        if (target - state.target_deg).abs() < self.config.deadzone_deg {
            return;
        }
        state.target_deg = target;
    }

    /// Shift the target relative to its current value (pre-invert frame).
    pub fn nudge(&self, delta_deg: f64) {
        let current = {
            let state = self.state.lock().expect("servo state");
            if self.config.invert {
                self.config.max_angle_deg - state.target_deg + self.config.min_angle_deg
            } else {
                state.target_deg
            }
        };
        self.set_target(current + delta_deg);
    }

    /// Target the neutral angle.
    pub fn move_to_neutral(&self) {
        self.set_target(self.config.neutral_deg);
    }

    /// Advance the motion profile by `dt` and write the resulting pulse.
    ///
    /// Motion state is committed before the bus write, so a failed write
    /// converges on retry once the bus recovers.
    pub fn advance(&self, dt: Duration) -> Result<()> {
        let dt = dt.as_secs_f64();
        if dt <= 0.0 {
            return Ok(());
        }
        {
            let mut state = self.state.lock().expect("servo state");
            let error = state.target_deg - state.angle_deg;
            if error.abs() <= self.config.deadzone_deg {
                state.velocity_deg_per_s = 0.0;
                return Ok(());
            }

            let desired = (error / dt).clamp(
                -self.config.max_speed_deg_per_s,
                self.config.max_speed_deg_per_s,
            );
            let max_dv = self.config.max_accel_deg_per_s2 * dt;
            let dv = (desired - state.velocity_deg_per_s).clamp(-max_dv, max_dv);
            let velocity = (state.velocity_deg_per_s + dv).clamp(
                -self.config.max_speed_deg_per_s,
                self.config.max_speed_deg_per_s,
            );
            let mut angle = state.angle_deg + velocity * dt;
            let mut velocity = velocity;
            // When the step crosses the target, land on it exactly.
            if error.signum() != (state.target_deg - angle).signum() {
                angle = state.target_deg;
                velocity = 0.0;
            }
            state.angle_deg = self.config.clamp_angle(angle);
            state.velocity_deg_per_s = velocity;
        }
        self.write_current_pulse()
    }

    /// Advance using wall-clock time since the previous tick.
    pub fn tick(&self, now: Instant) -> Result<()> {
        let dt = {
            let mut state = self.state.lock().expect("servo state");
            let dt = state
                .last_tick
                .map(|prev| now.saturating_duration_since(prev))
                .unwrap_or_default();
            state.last_tick = Some(now);
            dt
        };
        self.advance(dt)
    }

    /// Stop issuing pulses on this channel.
    pub fn release(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("servo state");
            state.last_pulse_us = None;
        }
        let mut bus = self.bus.lock().expect("pwm bus");
        bus.release_channel(self.channel)
    }

    fn angle_to_pulse(&self, angle_deg: f64) -> f64 {
        let span = self.config.max_angle_deg - self.config.min_angle_deg;
        let normalized = ((angle_deg - self.config.min_angle_deg) / span).clamp(0.0, 1.0);
        self.config.min_pulse_us + normalized * (self.config.max_pulse_us - self.config.min_pulse_us)
    }

    fn write_current_pulse(&self) -> Result<()> {
        let (pulse, dirty) = {
            let state = self.state.lock().expect("servo state");
            let pulse = self.angle_to_pulse(state.angle_deg);
            (pulse, state.last_pulse_us != Some(pulse))
        };
        if !dirty {
            return Ok(());
        }
        trace!(servo = %self.name, channel = self.channel, pulse_us = pulse, "pwm write");
        {
            let mut bus = self.bus.lock().expect("pwm bus");
            bus.set_pulse_us(self.channel, pulse, self.config.pwm_freq_hz)?;
        }
        // Committed only after a successful write, so a failed write is
        // retried on the next tick even when the angle has settled.
        let mut state = self.state.lock().expect("servo state");
        state.last_pulse_us = Some(pulse);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{shared, MockBus, SharedBus};
    use std::sync::Arc;

    fn test_config() -> ServoConfig {
        ServoConfig {
            min_angle_deg: -45.0,
            max_angle_deg: 45.0,
            min_pulse_us: 600.0,
            max_pulse_us: 2400.0,
            max_speed_deg_per_s: 90.0,
            max_accel_deg_per_s2: 360.0,
            deadzone_deg: 1.0,
            neutral_deg: 0.0,
            invert: false,
            pwm_freq_hz: 50.0,
        }
    }

    fn fast_config() -> ServoConfig {
        ServoConfig {
            max_speed_deg_per_s: 10_000.0,
            max_accel_deg_per_s2: 100_000.0,
            ..test_config()
        }
    }

    fn settle(servo: &Servo) {
        for _ in 0..200 {
            servo.advance(Duration::from_millis(20)).unwrap();
            if servo.is_settled(1e-6) {
                break;
            }
        }
    }

    fn mock_bus() -> (Arc<std::sync::Mutex<MockBus>>, SharedBus) {
        let mock = Arc::new(std::sync::Mutex::new(MockBus::new()));
        let bus: SharedBus = mock.clone();
        (mock, bus)
    }

    #[test]
    fn reaches_target_within_limits() {
        let bus = shared(MockBus::new());
        let servo = Servo::new("NPT", 3, test_config(), bus).unwrap();
        servo.set_target(30.0);
        settle(&servo);
        assert!((servo.angle() - 30.0).abs() <= 1e-3);
        assert!(servo.angle() >= -45.0 && servo.angle() <= 45.0);
    }

    #[test]
    fn clamps_out_of_range_targets() {
        let bus = shared(MockBus::new());
        let servo = Servo::new("NPT", 3, test_config(), bus).unwrap();
        servo.set_target(500.0);
        assert!((servo.target() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn deadzone_suppresses_micro_moves() {
        let bus = shared(MockBus::new());
        let servo = Servo::new("NPT", 3, test_config(), bus).unwrap();
        servo.set_target(0.4);
        servo.advance(Duration::from_millis(50)).unwrap();
        assert!(servo.angle().abs() < 1e-9);
        assert!(servo.target().abs() < 1e-9);
    }

    #[test]
    fn acceleration_and_speed_limits_hold() {
        let bus = shared(MockBus::new());
        let servo = Servo::new("NPT", 3, test_config(), bus).unwrap();
        servo.set_target(30.0);

        servo.advance(Duration::from_millis(100)).unwrap();
        // 360 deg/s^2 over 0.1 s allows at most 36 deg/s.
        assert!(servo.velocity().abs() <= 36.0 + 1e-6);
        assert!(servo.angle().abs() <= 3.6 + 1e-6);

        let mut previous = servo.velocity();
        for _ in 0..50 {
            servo.advance(Duration::from_millis(100)).unwrap();
            let velocity = servo.velocity();
            assert!(velocity.abs() <= 90.0 + 1e-6);
            assert!((velocity - previous).abs() <= 36.0 + 1e-6);
            previous = velocity;
        }
    }

    #[test]
    fn never_overshoots_target() {
        let bus = shared(MockBus::new());
        let servo = Servo::new("NPT", 3, fast_config(), bus).unwrap();
        servo.set_target(10.0);
        for _ in 0..100 {
            servo.advance(Duration::from_millis(20)).unwrap();
            assert!(servo.angle() <= 10.0 + 1e-9);
        }
        assert!((servo.angle() - 10.0).abs() <= 1e-6);
        assert!(servo.velocity().abs() < 1e-9);
    }

    #[test]
    fn pulse_endpoints_map_linearly() {
        let (mock, bus) = mock_bus();
        let servo = Servo::new("NPT", 3, fast_config(), bus).unwrap();
        for (angle, pulse) in [(45.0, 2400.0), (-45.0, 600.0), (0.0, 1500.0)] {
            servo.set_target(angle);
            settle(&servo);
            let written = mock.lock().unwrap().last_pulse(3).unwrap();
            // One PWM tick at 50 Hz is ~4.88 us of quantisation.
            assert!((written - pulse).abs() < 5.0);
        }
    }

    #[test]
    fn invert_swaps_endpoints() {
        let config = ServoConfig {
            invert: true,
            ..fast_config()
        };
        let (mock, bus) = mock_bus();
        let servo = Servo::new("EYR", 1, config, bus).unwrap();
        servo.set_target(-45.0);
        settle(&servo);
        // Commanding the minimum angle lands on the maximum pulse.
        assert!((mock.lock().unwrap().last_pulse(1).unwrap() - 2400.0).abs() < 5.0);
        servo.set_target(45.0);
        settle(&servo);
        assert!((mock.lock().unwrap().last_pulse(1).unwrap() - 600.0).abs() < 5.0);
    }

    #[test]
    fn bus_failure_bubbles_but_state_advances() {
        let (mock, bus) = mock_bus();
        let servo = Servo::new("MOU", 5, test_config(), bus).unwrap();
        servo.set_target(20.0);
        mock.lock().unwrap().fail_writes = 1;

        let before = servo.angle();
        let result = servo.advance(Duration::from_millis(100));
        assert!(result.is_err());
        assert!(servo.angle() > before);

        // Once the bus recovers, the next tick writes the caught-up pulse.
        settle(&servo);
        let written = mock.lock().unwrap().last_pulse(5).unwrap();
        let expected = servo.angle_to_pulse(servo.angle());
        assert!((written - expected).abs() < 5.0);
    }

    #[test]
    fn rejects_invalid_configs() {
        let bad = ServoConfig {
            min_angle_deg: 10.0,
            max_angle_deg: -10.0,
            ..ServoConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = ServoConfig {
            neutral_deg: 120.0,
            ..ServoConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
