//! Eyelid controller with autonomous blinking.

use crate::error::Result;
use crate::servo::Servo;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Offset from the open angle that fully closes the lid.
const CLOSED_OFFSET_DEG: f64 = 60.0;

/// Blink timing and rest angle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EyelidConfig {
    pub open_angle_deg: f64,
    pub blink_interval_min_s: f64,
    pub blink_interval_max_s: f64,
    pub blink_close_s: f64,
    pub blink_hold_s: f64,
    pub blink_open_s: f64,
    pub sleep_fraction: f64,
}

impl Default for EyelidConfig {
    fn default() -> Self {
        Self {
            open_angle_deg: -15.0,
            blink_interval_min_s: 3.0,
            blink_interval_max_s: 7.0,
            blink_close_s: 0.06,
            blink_hold_s: 0.04,
            blink_open_s: 0.07,
            sleep_fraction: 0.7,
        }
    }
}

/// Eyelid operating mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EyelidMode {
    /// Autonomous blinking between random intervals.
    Auto,
    /// Keep the current position, no blinking.
    Hold,
    /// Fully closed.
    Closed,
    /// Partially closed by the configured sleep fraction.
    Sleep,
}

#[derive(Debug, Clone, Copy)]
enum LidState {
    Mode(EyelidMode),
    /// Temporary override; reverts to `Auto` once expired.
    Override { angle_deg: f64, until: Instant },
}

struct Shared {
    servo: Arc<Servo>,
    config: EyelidConfig,
    closed_angle_deg: f64,
    state: Mutex<LidState>,
    blinking: AtomicBool,
    stop: AtomicBool,
}

/// Threaded blinker for the LID servo.
pub struct EyelidController {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EyelidController {
    /// Start the blink thread and open the lid.
    pub fn new(servo: Arc<Servo>, config: EyelidConfig) -> Result<Self> {
        let servo_cfg = servo.config();
        let closed = (config.open_angle_deg - CLOSED_OFFSET_DEG)
            .clamp(servo_cfg.min_angle_deg, servo_cfg.max_angle_deg);
        let shared = Arc::new(Shared {
            servo,
            closed_angle_deg: closed,
            config,
            state: Mutex::new(LidState::Mode(EyelidMode::Auto)),
            blinking: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name("eyelid-blink".to_string())
            .spawn(move || blink_loop(&worker))?;

        let controller = Self {
            shared,
            thread: Mutex::new(Some(handle)),
        };
        controller.apply_fraction(0.0);
        info!(closed_angle = closed, "eyelid controller started");
        Ok(controller)
    }

    /// Switch operating mode.
    pub fn set_mode(&self, mode: EyelidMode) {
        {
            let mut state = self.shared.state.lock().expect("eyelid state");
            *state = LidState::Mode(mode);
        }
        match mode {
            EyelidMode::Auto => self.apply_fraction(0.0),
            EyelidMode::Closed => self.apply_fraction(1.0),
            EyelidMode::Sleep => self.apply_fraction(self.shared.config.sleep_fraction),
            EyelidMode::Hold => {}
        }
    }

    /// Current mode (`Auto` while an override is pending expiry).
    #[must_use]
    pub fn mode(&self) -> EyelidMode {
        match *self.shared.state.lock().expect("eyelid state") {
            LidState::Mode(mode) => mode,
            LidState::Override { .. } => EyelidMode::Auto,
        }
    }

    /// Suspend blinking and hold `angle_deg` for `duration`.
    pub fn set_override(&self, angle_deg: f64, duration: Duration) {
        {
            let mut state = self.shared.state.lock().expect("eyelid state");
            *state = LidState::Override {
                angle_deg,
                until: Instant::now() + duration,
            };
        }
        self.shared.servo.set_target(angle_deg);
        self.sync_servo();
    }

    /// Override using a closed-state fraction instead of an angle.
    pub fn override_fraction(&self, fraction: f64, duration: Duration) {
        self.set_override(self.angle_for_fraction(fraction), duration);
    }

    /// Absolute angle for a closed-state fraction in `[0, 1]`.
    #[must_use]
    pub fn angle_for_fraction(&self, fraction: f64) -> f64 {
        let fraction = fraction.clamp(0.0, 1.0);
        self.shared.config.open_angle_deg
            + fraction * (self.shared.closed_angle_deg - self.shared.config.open_angle_deg)
    }

    /// Run one close-hold-open blink, blocking for its duration.
    pub fn blink_once(&self) {
        do_blink(&self.shared);
    }

    /// Close the lid and stop the blink thread.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().expect("eyelid state");
            *state = LidState::Mode(EyelidMode::Closed);
        }
        self.apply_fraction(1.0);
        if let Some(handle) = self.thread.lock().expect("eyelid thread").take() {
            let _ = handle.join();
        }
        debug!("eyelid controller stopped");
    }

    fn apply_fraction(&self, fraction: f64) {
        apply_fraction(&self.shared, fraction);
    }

    fn sync_servo(&self) {
        sync_servo(&self.shared);
    }
}

fn apply_fraction(shared: &Shared, fraction: f64) {
    let fraction = fraction.clamp(0.0, 1.0);
    let angle = shared.config.open_angle_deg
        + fraction * (shared.closed_angle_deg - shared.config.open_angle_deg);
    shared.servo.set_target(angle);
    sync_servo(shared);
}

fn sync_servo(shared: &Shared) {
    for _ in 0..3 {
        let _ = shared.servo.advance(Duration::from_millis(50));
    }
}

fn do_blink(shared: &Shared) {
    {
        let state = shared.state.lock().expect("eyelid state");
        if !matches!(*state, LidState::Mode(EyelidMode::Auto | EyelidMode::Hold)) {
            return;
        }
    }
    if shared.blinking.swap(true, Ordering::SeqCst) {
        return;
    }

    animate(shared, 0.0, 1.0, shared.config.blink_close_s);
    interruptible_sleep(shared, shared.config.blink_hold_s);
    animate(shared, 1.0, 0.0, shared.config.blink_open_s);

    shared.blinking.store(false, Ordering::SeqCst);
}

fn animate(shared: &Shared, from: f64, to: f64, duration_s: f64) {
    const STEPS: usize = 8;
    if duration_s <= 0.0 {
        apply_fraction(shared, to);
        return;
    }
    let step = duration_s / STEPS as f64;
    for index in 0..=STEPS {
        {
            let state = shared.state.lock().expect("eyelid state");
            if !matches!(*state, LidState::Mode(EyelidMode::Auto | EyelidMode::Hold)) {
                return;
            }
        }
        let fraction = from + (to - from) * (index as f64 / STEPS as f64);
        apply_fraction(shared, fraction);
        interruptible_sleep(shared, step);
    }
}

fn interruptible_sleep(shared: &Shared, duration_s: f64) {
    let deadline = Instant::now() + Duration::from_secs_f64(duration_s.max(0.0));
    while !shared.stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

fn blink_loop(shared: &Shared) {
    let mut rng = rand::thread_rng();
    while !shared.stop.load(Ordering::SeqCst) {
        let wait = rng.gen_range(
            shared.config.blink_interval_min_s..=shared.config.blink_interval_max_s,
        );
        interruptible_sleep(shared, wait);
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        {
            let mut state = shared.state.lock().expect("eyelid state");
            if let LidState::Override { angle_deg, until } = *state {
                if Instant::now() < until {
                    shared.servo.set_target(angle_deg);
                    drop(state);
                    sync_servo(shared);
                    continue;
                }
                *state = LidState::Mode(EyelidMode::Auto);
            }
            if !matches!(*state, LidState::Mode(EyelidMode::Auto)) {
                continue;
            }
        }
        do_blink(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{shared as shared_bus, MockBus};
    use crate::servo::ServoConfig;

    fn lid_servo() -> Arc<Servo> {
        let config = ServoConfig {
            min_angle_deg: -90.0,
            max_angle_deg: 59.0,
            max_speed_deg_per_s: 50_000.0,
            max_accel_deg_per_s2: 50_000.0,
            deadzone_deg: 1.0,
            neutral_deg: -15.0,
            ..ServoConfig::default()
        };
        Arc::new(Servo::new("LID", 2, config, shared_bus(MockBus::new())).unwrap())
    }

    fn quick_config() -> EyelidConfig {
        EyelidConfig {
            open_angle_deg: -15.0,
            blink_interval_min_s: 60.0,
            blink_interval_max_s: 90.0,
            blink_close_s: 0.01,
            blink_hold_s: 0.005,
            blink_open_s: 0.01,
            sleep_fraction: 0.7,
        }
    }

    #[test]
    fn closed_angle_is_open_minus_sixty_clamped() {
        let servo = lid_servo();
        let lids = EyelidController::new(servo, quick_config()).unwrap();
        assert_eq!(lids.angle_for_fraction(1.0), -75.0);
        assert_eq!(lids.angle_for_fraction(0.0), -15.0);
        lids.shutdown();
    }

    #[test]
    fn modes_drive_expected_targets() {
        let servo = lid_servo();
        let lids = EyelidController::new(servo.clone(), quick_config()).unwrap();

        lids.set_mode(EyelidMode::Closed);
        assert!((servo.target() - (-75.0)).abs() < 1e-6);

        lids.set_mode(EyelidMode::Sleep);
        // open + 0.7 * (closed - open) = -15 + 0.7 * -60 = -57
        assert!((servo.target() - (-57.0)).abs() < 1e-6);

        lids.set_mode(EyelidMode::Auto);
        assert!((servo.target() - (-15.0)).abs() < 1e-6);
        lids.shutdown();
    }

    #[test]
    fn blink_reaches_closed_and_reopens() {
        let servo = lid_servo();
        let lids = EyelidController::new(servo.clone(), quick_config()).unwrap();
        lids.blink_once();
        // After a full blink the lid is back at the open angle.
        assert!((servo.target() - (-15.0)).abs() < 1e-6);
        lids.shutdown();
    }

    #[test]
    fn override_suspends_then_resumes_auto() {
        let servo = lid_servo();
        let config = EyelidConfig {
            blink_interval_min_s: 0.02,
            blink_interval_max_s: 0.04,
            ..quick_config()
        };
        let lids = EyelidController::new(servo.clone(), config).unwrap();

        lids.set_override(5.0, Duration::from_millis(80));
        assert!((servo.target() - 5.0).abs() < 1e-6);

        // While the override is active the blink loop keeps re-applying it.
        std::thread::sleep(Duration::from_millis(40));
        assert!((servo.target() - 5.0).abs() < 1e-6);

        // After expiry the loop reverts to auto and blinks again; the lid
        // ends up at (or heading back to) the open angle.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(lids.mode(), EyelidMode::Auto);
        lids.shutdown();
    }

    #[test]
    fn shutdown_closes_the_lid() {
        let servo = lid_servo();
        let lids = EyelidController::new(servo.clone(), quick_config()).unwrap();
        lids.set_mode(EyelidMode::Auto);
        lids.shutdown();
        assert!((servo.target() - (-75.0)).abs() < 1e-6);
    }
}
