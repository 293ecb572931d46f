//! Half-duplex gate for the microphone path.
//!
//! While the robot speaks, its own output must not re-enter the pipeline.
//! With barge-in disabled, the gate mutes capture for the duration of the
//! TTS turn and keeps it muted through a short cooldown so the speaker
//! tail decays before listening resumes.

use crate::input::Microphone;
use crate::wake::WakeWordDetector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Global listen switch honored by the capture callback.
#[derive(Clone)]
pub struct ListenGate {
    enabled: Arc<AtomicBool>,
}

impl ListenGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether capture is currently allowed.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the global listen switch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for ListenGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped half-duplex acquisition around one TTS turn.
pub struct TtsGate {
    gate: ListenGate,
    turn: Mutex<()>,
    barge_in: bool,
    cooldown: Duration,
}

impl TtsGate {
    /// Build the gate; `barge_in` leaves the mic open during speech.
    #[must_use]
    pub fn new(gate: ListenGate, barge_in: bool, cooldown: Duration) -> Self {
        Self {
            gate,
            turn: Mutex::new(()),
            barge_in,
            cooldown,
        }
    }

    /// Whether barge-in is enabled.
    #[must_use]
    pub fn barge_in(&self) -> bool {
        self.barge_in
    }

    /// Enter a TTS turn. Concurrent turns block here until the current
    /// speaker finishes.
    pub fn begin(&self) -> TtsTurn<'_> {
        let lock = self.turn.lock().expect("tts turn");
        if !self.barge_in {
            self.gate.set_enabled(false);
            debug!("mic muted for TTS turn");
        }
        TtsTurn {
            gate: self,
            finished: false,
            _lock: lock,
        }
    }
}

/// Guard held while TTS audio plays.
pub struct TtsTurn<'a> {
    gate: &'a TtsGate,
    finished: bool,
    _lock: MutexGuard<'a, ()>,
}

impl TtsTurn<'_> {
    /// End the turn: wait out the cooldown, flush stale audio and rearm
    /// the wake detector, then reopen the mic.
    pub fn finish(mut self, mic: &dyn Microphone, wake: &mut WakeWordDetector) {
        if !self.gate.barge_in {
            std::thread::sleep(self.gate.cooldown);
            mic.flush();
            wake.reset_after_tts();
            self.gate.gate.set_enabled(true);
            debug!("mic reopened after TTS cooldown");
        } else {
            wake.reset_after_tts();
        }
        self.finished = true;
    }
}

impl Drop for TtsTurn<'_> {
    fn drop(&mut self) {
        // An abandoned turn must never leave the mic muted.
        if !self.finished && !self.gate.barge_in {
            self.gate.gate.set_enabled(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Recorder, RecorderConfig};
    use crate::wake::{WakeConfig, WakeWordDetector};

    fn wake_detector() -> WakeWordDetector {
        WakeWordDetector::with_energy_fallback(WakeConfig::default(), 16_000)
    }

    #[test]
    fn gate_mutes_until_finish() {
        let gate = ListenGate::new();
        let mic = Recorder::new(RecorderConfig::default(), gate.clone());
        let tts = TtsGate::new(gate.clone(), false, Duration::from_millis(5));
        let mut wake = wake_detector();

        let turn = tts.begin();
        assert!(!gate.enabled());
        turn.finish(&mic, &mut wake);
        assert!(gate.enabled());
    }

    #[test]
    fn barge_in_keeps_mic_open() {
        let gate = ListenGate::new();
        let mic = Recorder::new(RecorderConfig::default(), gate.clone());
        let tts = TtsGate::new(gate.clone(), true, Duration::from_millis(5));
        let mut wake = wake_detector();

        let turn = tts.begin();
        assert!(gate.enabled());
        turn.finish(&mic, &mut wake);
        assert!(gate.enabled());
    }

    #[test]
    fn dropped_turn_reopens_gate() {
        let gate = ListenGate::new();
        let tts = TtsGate::new(gate.clone(), false, Duration::from_millis(5));
        {
            let _turn = tts.begin();
            assert!(!gate.enabled());
        }
        assert!(gate.enabled());
    }
}
