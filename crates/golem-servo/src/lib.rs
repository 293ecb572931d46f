//! Golem Servo - actuator control
//!
//! This crate drives the animatronic's ten servos through a 16-channel PWM
//! expander:
//! - PWM bus driver (PCA9685 over I2C, plus a recording mock for tests)
//! - Per-servo motion profile (speed/acceleration limits, deadzone, invert)
//! - Servo registry built from the fixed mechanical layout plus a
//!   calibration overlay
//! - Eyelid controller with autonomous blinking
//! - Personality animation loops (listening, thinking, talking, idle)

#![forbid(unsafe_code)]

pub mod animation;
pub mod bus;
pub mod calibration;
pub mod error;
pub mod eyelid;
pub mod layout;
pub mod registry;
pub mod servo;

pub use animation::{AnimationConfig, Animations};
pub use bus::{MockBus, PwmBus, SharedBus};
pub use calibration::{load_calibration, ServoCalibration};
pub use error::{Result, ServoError};
pub use eyelid::{EyelidConfig, EyelidController, EyelidMode};
pub use layout::{layout_v1, pose, ServoDefinition, PERSONALITY_SERVOS, TRACKING_SERVOS};
pub use registry::{ServoRegistry, ServoRegistryBuilder};
pub use servo::{Servo, ServoConfig};

#[cfg(feature = "pca9685")]
pub use bus::pca9685::Pca9685;
