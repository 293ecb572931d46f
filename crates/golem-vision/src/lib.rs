//! Golem Vision - face detection and tracking
//!
//! Talks to the camera-side detector board over a serial link and closes
//! the loop from detections to eye, pitch, (optional) yaw and delayed
//! base-rotation wheel targets.

#![forbid(unsafe_code)]

pub mod client;
pub mod detection;
pub mod error;
pub mod tracker;

pub use client::{SerialLink, VisionClient, VisionSource};
pub use detection::Detection;
pub use error::{Result, VisionError};
pub use tracker::{FaceTracker, TrackerConfig, TrackingServos};
