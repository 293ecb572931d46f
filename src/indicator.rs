//! Status indicator surface.
//!
//! The physical indicator (an RGB LED on the head) lives outside this
//! process; the dialogue controller only pushes state transitions through
//! this narrow trait. The default implementation logs them.

use tracing::info;

/// Externally visible robot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    AwaitWake,
    Listening,
    Thinking,
    Speaking,
    AwaitFollowup,
    Off,
}

/// Consumer of robot state transitions.
pub trait StatusIndicator: Send + Sync {
    /// Display the given state.
    fn set_state(&self, state: RobotState);
}

/// Log-only indicator used when no hardware is attached.
#[derive(Default)]
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set_state(&self, state: RobotState) {
        info!(?state, "robot state");
    }
}
