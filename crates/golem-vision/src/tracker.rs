//! Closed-loop face tracker.
//!
//! Polls the vision client from its own thread and maps detection error
//! to servo targets: symmetric eye deltas, head pitch, optional yaw, and
//! a delayed base rotation through the wheels once the eyes have strayed
//! far enough for long enough. Loss of the face returns everything to
//! neutral; an optional patrol scan sweeps the room while idle.

use crate::client::VisionSource;
use crate::detection::Detection;
use crate::error::VisionError;
use golem_servo::Servo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tracking gains, deadzones and intervals.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_frame_width")]
    pub frame_width: f64,
    #[serde(default = "default_frame_height")]
    pub frame_height: f64,
    /// Whether the detector reports `(x, y)` as the box center.
    #[serde(default = "default_true")]
    pub coordinates_are_center: bool,
    #[serde(default = "default_eye_deadzone_px")]
    pub eye_deadzone_px: f64,
    #[serde(default = "default_axis_deadzone_px")]
    pub pitch_deadzone_px: f64,
    #[serde(default = "default_axis_deadzone_px")]
    pub yaw_deadzone_px: f64,
    #[serde(default = "default_eye_gain")]
    pub eye_gain_deg_per_px: f64,
    /// Sign encodes the mechanical direction; flip it if the head nods
    /// away from the face.
    #[serde(default = "default_pitch_gain")]
    pub pitch_gain_deg_per_px: f64,
    #[serde(default = "default_yaw_gain")]
    pub yaw_gain_deg_per_px: f64,
    #[serde(default = "default_eye_max_delta")]
    pub eye_max_delta_deg: f64,
    #[serde(default = "default_pitch_max_delta")]
    pub pitch_max_delta_deg: f64,
    #[serde(default = "default_yaw_max_delta")]
    pub yaw_max_delta_deg: f64,
    #[serde(default = "default_invoke_interval_s")]
    pub invoke_interval_s: f64,
    #[serde(default = "default_invoke_timeout_s")]
    pub invoke_timeout_s: f64,
    #[serde(default = "default_update_interval_s")]
    pub update_interval_s: f64,
    #[serde(default = "default_neutral_timeout_s")]
    pub neutral_timeout_s: f64,
    #[serde(default = "default_wheel_deadzone_deg")]
    pub wheel_deadzone_deg: f64,
    #[serde(default = "default_wheel_follow_delay_s")]
    pub wheel_follow_delay_s: f64,
    /// Eye deviation (deg) where the wheel remap starts.
    #[serde(default = "default_wheel_input_min_deg")]
    pub wheel_input_min_deg: f64,
    /// Eye deviation (deg) where the wheel remap saturates.
    #[serde(default = "default_wheel_input_max_deg")]
    pub wheel_input_max_deg: f64,
    /// Wheel offset (deg) at the start of the remap.
    #[serde(default)]
    pub wheel_output_min_deg: f64,
    /// Wheel offset (deg) at saturation.
    #[serde(default = "default_wheel_output_max_deg")]
    pub wheel_output_max_deg: f64,
    #[serde(default = "default_wheel_power")]
    pub wheel_power: f64,
    /// Consecutive invoke timeouts before a warning is logged.
    #[serde(default = "default_timeout_streak")]
    pub timeout_streak_warn: u32,
    #[serde(default = "default_true")]
    pub patrol_enabled: bool,
    #[serde(default = "default_patrol_interval_s")]
    pub patrol_interval_s: f64,
    #[serde(default = "default_patrol_wheels_deg")]
    pub patrol_range_wheels_deg: f64,
    #[serde(default = "default_patrol_eyes_deg")]
    pub patrol_range_eyes_deg: f64,
    #[serde(default = "default_patrol_pitch_deg")]
    pub patrol_range_pitch_deg: f64,
}

fn default_frame_width() -> f64 {
    220.0
}
fn default_frame_height() -> f64 {
    200.0
}
fn default_true() -> bool {
    true
}
fn default_eye_deadzone_px() -> f64 {
    10.0
}
fn default_axis_deadzone_px() -> f64 {
    18.0
}
fn default_eye_gain() -> f64 {
    0.08
}
fn default_pitch_gain() -> f64 {
    0.06
}
fn default_yaw_gain() -> f64 {
    0.05
}
fn default_eye_max_delta() -> f64 {
    20.0
}
fn default_pitch_max_delta() -> f64 {
    20.0
}
fn default_yaw_max_delta() -> f64 {
    30.0
}
fn default_invoke_interval_s() -> f64 {
    0.15
}
fn default_invoke_timeout_s() -> f64 {
    0.25
}
fn default_update_interval_s() -> f64 {
    0.02
}
fn default_neutral_timeout_s() -> f64 {
    2.0
}
fn default_wheel_deadzone_deg() -> f64 {
    5.0
}
fn default_wheel_follow_delay_s() -> f64 {
    0.8
}
fn default_wheel_input_min_deg() -> f64 {
    5.0
}
fn default_wheel_input_max_deg() -> f64 {
    45.0
}
fn default_wheel_output_max_deg() -> f64 {
    25.0
}
fn default_wheel_power() -> f64 {
    2.0
}
fn default_timeout_streak() -> u32 {
    5
}
fn default_patrol_interval_s() -> f64 {
    30.0
}
fn default_patrol_wheels_deg() -> f64 {
    40.0
}
fn default_patrol_eyes_deg() -> f64 {
    25.0
}
fn default_patrol_pitch_deg() -> f64 {
    15.0
}

impl Default for TrackerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Servo handles the tracker drives.
#[derive(Clone)]
pub struct TrackingServos {
    pub eyes: Vec<Arc<Servo>>,
    pub yaw: Option<Arc<Servo>>,
    pub pitch: Option<Arc<Servo>>,
    pub wheels: Vec<Arc<Servo>>,
}

impl TrackingServos {
    fn all(&self) -> impl Iterator<Item = &Arc<Servo>> {
        self.eyes
            .iter()
            .chain(self.yaw.iter())
            .chain(self.pitch.iter())
            .chain(self.wheels.iter())
    }
}

#[derive(Debug, Clone, Copy)]
struct PatrolStep {
    wheel_offset: f64,
    eye_offset: f64,
    pitch_offset: f64,
    hold: Duration,
}

struct PatrolRun {
    steps: Vec<PatrolStep>,
    index: usize,
    deadline: Instant,
}

fn patrol_steps(config: &TrackerConfig) -> Vec<PatrolStep> {
    let wheels = config.patrol_range_wheels_deg;
    let eyes = config.patrol_range_eyes_deg;
    let nod = config.patrol_range_pitch_deg.min(10.0);
    let step = |wheel_offset, eye_offset, pitch_offset, secs: f64| PatrolStep {
        wheel_offset,
        eye_offset,
        pitch_offset,
        hold: Duration::from_secs_f64(secs),
    };
    vec![
        // Eyes lead left, body follows, quick nod.
        step(0.0, -eyes, 0.0, 0.5),
        step(wheels, -eyes, 0.0, 2.0),
        step(wheels, -eyes, nod, 0.4),
        step(wheels, -eyes, 0.0, 0.4),
        // Same to the right.
        step(wheels, eyes, 0.0, 0.6),
        step(-wheels, eyes, 0.0, 3.0),
        step(-wheels, eyes, nod, 0.4),
        step(-wheels, eyes, 0.0, 0.4),
        // Back to center.
        step(-wheels, 0.0, 0.0, 0.5),
        step(0.0, 0.0, 0.0, 1.5),
    ]
}

pub(crate) struct TrackerCore {
    config: TrackerConfig,
    servos: TrackingServos,
    last_detection: Instant,
    wheel_trigger: Option<Instant>,
    wheel_active: bool,
    timeout_streak: u32,
    patrol: Option<PatrolRun>,
    last_patrol_finish: Instant,
}

impl TrackerCore {
    fn new(config: TrackerConfig, servos: TrackingServos, now: Instant) -> Self {
        Self {
            config,
            servos,
            last_detection: now,
            wheel_trigger: None,
            wheel_active: false,
            timeout_streak: 0,
            patrol: None,
            last_patrol_finish: now,
        }
    }

    fn extract_center(&self, det: &Detection) -> (f64, f64) {
        if self.config.coordinates_are_center {
            (det.x, det.y)
        } else {
            (det.center_x(), det.center_y())
        }
    }

    fn best_box(boxes: &[Detection]) -> Option<&Detection> {
        boxes.iter().max_by(|a, b| {
            let key_a = (a.score.unwrap_or(0.0), a.area());
            let key_b = (b.score.unwrap_or(0.0), b.area());
            key_a
                .partial_cmp(&key_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    fn handle_detections(&mut self, now: Instant, boxes: &[Detection]) {
        let Some(best) = Self::best_box(boxes) else {
            self.handle_missing_detection(now);
            return;
        };
        self.timeout_streak = 0;
        self.patrol = None;
        self.last_patrol_finish = now;

        let cfg = &self.config;
        let (cx, cy) = self.extract_center(best);
        let error_x = cx - cfg.frame_width / 2.0;
        let error_y = cy - cfg.frame_height / 2.0;

        // Deltas go through nudge(), which shifts the target in the
        // pre-invert frame so mirrored servos move the right way.
        if error_x.abs() > cfg.eye_deadzone_px {
            let delta = (error_x * cfg.eye_gain_deg_per_px)
                .clamp(-cfg.eye_max_delta_deg, cfg.eye_max_delta_deg);
            for eye in &self.servos.eyes {
                eye.nudge(delta);
            }
        }
        if let Some(yaw) = &self.servos.yaw {
            if error_x.abs() > cfg.yaw_deadzone_px {
                let delta = (error_x * cfg.yaw_gain_deg_per_px)
                    .clamp(-cfg.yaw_max_delta_deg, cfg.yaw_max_delta_deg);
                yaw.nudge(delta);
            }
        }
        if let Some(pitch) = &self.servos.pitch {
            if error_y.abs() > cfg.pitch_deadzone_px {
                let delta = (error_y * cfg.pitch_gain_deg_per_px)
                    .clamp(-cfg.pitch_max_delta_deg, cfg.pitch_max_delta_deg);
                pitch.nudge(delta);
            }
        }

        self.update_wheels(now, error_x);
        self.last_detection = now;
    }

    fn handle_missing_detection(&mut self, now: Instant) {
        if now.duration_since(self.last_detection).as_secs_f64() < self.config.neutral_timeout_s {
            return;
        }
        if self.patrol.is_none() {
            for servo in self.servos.all() {
                servo.move_to_neutral();
            }
            self.reset_wheel_follow();
        }
    }

    fn eye_neutral(&self) -> f64 {
        let eyes = &self.servos.eyes;
        if eyes.is_empty() {
            return 0.0;
        }
        eyes.iter().map(|s| s.config().neutral_deg).sum::<f64>() / eyes.len() as f64
    }

    fn average_eye_target(&self) -> f64 {
        let eyes = &self.servos.eyes;
        if eyes.is_empty() {
            return 0.0;
        }
        eyes.iter().map(|s| s.target()).sum::<f64>() / eyes.len() as f64
    }

    fn update_wheels(&mut self, now: Instant, error_x: f64) {
        if self.servos.wheels.is_empty() {
            return;
        }
        let cfg = &self.config;
        if error_x.abs() <= cfg.eye_deadzone_px {
            self.reset_wheel_follow();
            return;
        }
        let deviation = self.average_eye_target() - self.eye_neutral();
        if deviation.abs() <= cfg.wheel_deadzone_deg {
            self.reset_wheel_follow();
            return;
        }
        let trigger = *self.wheel_trigger.get_or_insert(now);
        if now.duration_since(trigger).as_secs_f64() < cfg.wheel_follow_delay_s {
            return;
        }
        let offset = wheel_offset(cfg, deviation.abs()).copysign(deviation);
        for wheel in &self.servos.wheels {
            wheel.set_target(wheel.config().neutral_deg + offset);
        }
        self.wheel_active = true;
    }

    fn reset_wheel_follow(&mut self) {
        self.wheel_trigger = None;
        if self.wheel_active {
            for wheel in &self.servos.wheels {
                wheel.move_to_neutral();
            }
            self.wheel_active = false;
        }
    }

    fn apply_patrol_pose(&self, step: &PatrolStep) {
        for wheel in &self.servos.wheels {
            wheel.set_target(wheel.config().neutral_deg + step.wheel_offset);
        }
        for eye in &self.servos.eyes {
            eye.set_target(eye.config().neutral_deg + step.eye_offset);
        }
        if let Some(pitch) = &self.servos.pitch {
            pitch.set_target(pitch.config().neutral_deg + step.pitch_offset);
        }
    }

    /// Drive the idle branch: neutral return, then patrol scans.
    fn handle_idle(&mut self, now: Instant) {
        if let Some(run) = self.patrol.as_mut() {
            if now < run.deadline {
                return;
            }
            run.index += 1;
            let next = if run.index < run.steps.len() {
                let step = run.steps[run.index];
                run.deadline = now + step.hold;
                Some(step)
            } else {
                None
            };
            match next {
                Some(step) => self.apply_patrol_pose(&step),
                None => {
                    self.patrol = None;
                    self.last_patrol_finish = now;
                    debug!("patrol finished");
                    for servo in self.servos.all() {
                        servo.move_to_neutral();
                    }
                }
            }
            return;
        }

        let idle_for = now.duration_since(self.last_detection).as_secs_f64();
        if idle_for > self.config.neutral_timeout_s {
            let since_patrol = now.duration_since(self.last_patrol_finish).as_secs_f64();
            if self.config.patrol_enabled && since_patrol > self.config.patrol_interval_s {
                info!("starting patrol scan");
                let steps = patrol_steps(&self.config);
                let first = steps[0];
                self.apply_patrol_pose(&first);
                self.patrol = Some(PatrolRun {
                    steps,
                    index: 0,
                    deadline: now + first.hold,
                });
                return;
            }
        }
        self.handle_missing_detection(now);
    }

    fn note_invoke_error(&mut self, error: &VisionError, now: Instant) {
        self.timeout_streak += 1;
        if self.timeout_streak == self.config.timeout_streak_warn {
            warn!(streak = self.timeout_streak, error = %error, "vision invokes failing");
        }
        // Degrade to the missing-detection branch; the thread never stops.
        self.handle_missing_detection(now);
    }
}

/// Non-linear deviation-to-wheel-offset remap.
fn wheel_offset(config: &TrackerConfig, deviation: f64) -> f64 {
    let span = config.wheel_input_max_deg - config.wheel_input_min_deg;
    if span <= 0.0 {
        return (config.wheel_output_min_deg + config.wheel_output_max_deg) / 2.0;
    }
    let u = ((deviation - config.wheel_input_min_deg) / span).clamp(0.0, 1.0);
    let v = u.powf(config.wheel_power);
    config.wheel_output_min_deg + v * (config.wheel_output_max_deg - config.wheel_output_min_deg)
}

/// Background face-tracking thread.
pub struct FaceTracker {
    stop: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FaceTracker {
    /// Spawn the tracker thread.
    #[must_use]
    pub fn start(
        mut source: Box<dyn VisionSource>,
        servos: TrackingServos,
        config: TrackerConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let enabled = Arc::new(AtomicBool::new(true));
        let stop_flag = stop.clone();
        let enabled_flag = enabled.clone();

        let handle = std::thread::Builder::new()
            .name("face-tracker".to_string())
            .spawn(move || {
                let update_interval = Duration::from_secs_f64(config.update_interval_s);
                let invoke_interval = Duration::from_secs_f64(config.invoke_interval_s);
                let invoke_timeout = Duration::from_secs_f64(config.invoke_timeout_s);
                let mut core = TrackerCore::new(config, servos, Instant::now());
                let mut next_invoke = Instant::now();

                info!("face tracker thread started");
                while !stop_flag.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    for servo in core.servos.all() {
                        let _ = servo.tick(now);
                    }

                    if enabled_flag.load(Ordering::SeqCst) && now >= next_invoke {
                        match source.invoke_once(invoke_timeout) {
                            Ok(boxes) if !boxes.is_empty() => {
                                core.handle_detections(now, &boxes);
                            }
                            Ok(_) => core.handle_idle(now),
                            Err(e) => core.note_invoke_error(&e, now),
                        }
                        next_invoke = now + invoke_interval;
                    }
                    std::thread::sleep(update_interval);
                }
                info!("face tracker thread stopped");
            })
            .expect("spawn tracker thread");

        Self {
            stop,
            enabled,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Pause or resume vision polling; servo ticking continues either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop and join the thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("tracker handle").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use golem_servo::{layout_v1, MockBus, ServoRegistryBuilder};
    use std::collections::HashMap;

    fn servos() -> TrackingServos {
        let mock = Arc::new(Mutex::new(MockBus::new()));
        let bus: golem_servo::SharedBus = mock;
        let mut builder = ServoRegistryBuilder::new(bus, HashMap::new());
        builder.register_all(&layout_v1()).unwrap();
        let registry = builder.build();
        TrackingServos {
            eyes: vec![registry.get("EYL").unwrap(), registry.get("EYR").unwrap()],
            yaw: None,
            pitch: Some(registry.get("NPT").unwrap()),
            wheels: vec![registry.get("LWH").unwrap(), registry.get("RWH").unwrap()],
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            patrol_enabled: false,
            ..TrackerConfig::default()
        }
    }

    fn face_at(x: f64, y: f64) -> Vec<Detection> {
        vec![Detection {
            x,
            y,
            width: 30.0,
            height: 40.0,
            score: Some(0.9),
        }]
    }

    #[test]
    fn face_right_of_center_moves_eyes() {
        let servos = servos();
        let now = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), now);
        let before: Vec<f64> = servos.eyes.iter().map(|e| e.target()).collect();

        // Frame center is (110, 100); +40 px to the right.
        core.handle_detections(now, &face_at(150.0, 100.0));
        for (eye, old) in servos.eyes.iter().zip(before) {
            assert!(eye.target() > old, "eye did not move right");
        }
    }

    #[test]
    fn centered_face_stays_in_deadzone() {
        let servos = servos();
        let now = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), now);
        let before: Vec<f64> = servos.eyes.iter().map(|e| e.target()).collect();

        core.handle_detections(now, &face_at(112.0, 101.0));
        for (eye, old) in servos.eyes.iter().zip(before) {
            assert_eq!(eye.target(), old);
        }
    }

    #[test]
    fn vertical_error_drives_pitch() {
        let servos = servos();
        let now = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), now);
        let pitch = servos.pitch.as_ref().unwrap();
        let before = pitch.target();

        core.handle_detections(now, &face_at(110.0, 160.0));
        assert!(pitch.target() > before);
    }

    #[test]
    fn loss_returns_everything_to_neutral() {
        let servos = servos();
        let now = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), now);
        core.handle_detections(now, &face_at(200.0, 180.0));

        // Within the timeout nothing snaps back yet.
        core.handle_missing_detection(now + Duration::from_millis(500));
        assert!(servos.eyes[0].target() != servos.eyes[0].config().neutral_deg);

        core.handle_missing_detection(now + Duration::from_secs(3));
        for servo in servos.all() {
            assert!(
                (servo.target() - servo.config().neutral_deg).abs() < 1e-6,
                "{} not neutral",
                servo.name()
            );
        }
    }

    #[test]
    fn wheels_wait_out_the_follow_delay() {
        let servos = servos();
        let base = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), base);
        let wheel = &servos.wheels[0];
        let neutral = wheel.config().neutral_deg;

        // Push the eyes far right repeatedly; deviation builds instantly
        // but wheels must hold until the delay has passed.
        for step in 0..3 {
            let now = base + Duration::from_millis(100 * step);
            core.handle_detections(now, &face_at(219.0, 100.0));
            assert_eq!(wheel.target(), neutral, "wheel moved before delay");
        }

        let later = base + Duration::from_secs_f64(1.0);
        core.handle_detections(later, &face_at(219.0, 100.0));
        assert!(wheel.target() > neutral, "wheel never followed");
    }

    #[test]
    fn wheels_reset_inside_deadzone() {
        let servos = servos();
        let base = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), base);

        for step in 0..12 {
            let now = base + Duration::from_millis(100 * step);
            core.handle_detections(now, &face_at(219.0, 100.0));
        }
        let wheel = &servos.wheels[0];
        assert!(wheel.target() > wheel.config().neutral_deg);

        // A centered face resets the follow and parks the wheels.
        core.handle_detections(base + Duration::from_secs(2), &face_at(110.0, 100.0));
        assert_eq!(wheel.target(), wheel.config().neutral_deg);
    }

    #[test]
    fn best_box_prefers_score_then_area() {
        let boxes = vec![
            Detection {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 100.0,
                score: Some(0.3),
            },
            Detection {
                x: 50.0,
                y: 50.0,
                width: 10.0,
                height: 10.0,
                score: Some(0.9),
            },
        ];
        let best = TrackerCore::best_box(&boxes).unwrap();
        assert_eq!(best.score, Some(0.9));
    }

    #[test]
    fn wheel_remap_is_monotone_and_clamped() {
        let cfg = config();
        assert_eq!(wheel_offset(&cfg, 0.0), 0.0);
        let mid = wheel_offset(&cfg, 25.0);
        let high = wheel_offset(&cfg, 45.0);
        assert!(mid > 0.0 && mid < high);
        assert!((high - cfg.wheel_output_max_deg).abs() < 1e-9);
        // Saturates beyond the input range.
        assert_eq!(wheel_offset(&cfg, 500.0), high);
    }

    #[test]
    fn invoke_errors_degrade_without_stopping() {
        let servos = servos();
        let base = Instant::now();
        let mut core = TrackerCore::new(config(), servos.clone(), base);
        core.handle_detections(base, &face_at(200.0, 100.0));

        for step in 0..8 {
            let now = base + Duration::from_secs(1 + step);
            core.note_invoke_error(&VisionError::Timeout(Duration::from_millis(250)), now);
        }
        // Degraded to neutral return.
        for servo in servos.all() {
            assert!((servo.target() - servo.config().neutral_deg).abs() < 1e-6);
        }
    }

    #[test]
    fn patrol_runs_and_aborts_on_detection() {
        let servos = servos();
        let base = Instant::now();
        let cfg = TrackerConfig {
            patrol_enabled: true,
            patrol_interval_s: 1.0,
            ..TrackerConfig::default()
        };
        let mut core = TrackerCore::new(cfg, servos.clone(), base);

        // Idle long enough to start a patrol.
        let idle = base + Duration::from_secs(5);
        core.handle_idle(idle);
        assert!(core.patrol.is_some());
        let eye = &servos.eyes[0];
        assert!((eye.target() - (eye.config().neutral_deg - 25.0)).abs() < 1e-6);

        // A face aborts the scan immediately.
        core.handle_detections(idle + Duration::from_millis(100), &face_at(150.0, 100.0));
        assert!(core.patrol.is_none());
    }
}
