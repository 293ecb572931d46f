//! Personality animation loops.
//!
//! Short-lived threads that drive disjoint servo sets while the robot
//! listens, thinks or talks, plus an idle fidget loop between wake words.
//! Every loop polls a stop flag each tick; stopping is idempotent and
//! restores the owned servos to neutral.

use crate::eyelid::EyelidController;
use crate::layout::{pose, PERSONALITY_SERVOS};
use crate::registry::ServoRegistry;
use crate::servo::Servo;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tick used when interpolating animation servo motion.
const ANIM_TICK: Duration = Duration::from_millis(50);

/// Animation tuning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Mouth toggle period while talking.
    pub mouth_step_ms: u64,
    /// Head-roll amplitude of the listening sway.
    pub listen_roll_deg: f64,
    /// Ear amplitude of the thinking loop.
    pub think_ear_deg: f64,
    /// Pitch nod amplitude of the thinking loop.
    pub think_nod_deg: f64,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            mouth_step_ms: 250,
            listen_roll_deg: 8.0,
            think_ear_deg: 25.0,
            think_nod_deg: 8.0,
        }
    }
}

struct AnimationHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl AnimationHandle {
    fn spawn(name: &'static str, body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("anim-{name}"))
            .spawn(move || body(flag))
            .expect("spawn animation thread");
        Self { stop, thread }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

/// Owner of the personality servos and their animation threads.
pub struct Animations {
    servos: HashMap<String, Arc<Servo>>,
    pitch: Option<Arc<Servo>>,
    eyelid: Option<Arc<EyelidController>>,
    config: AnimationConfig,
    listening: Mutex<Option<AnimationHandle>>,
    thinking: Mutex<Option<AnimationHandle>>,
    talking: Mutex<Option<AnimationHandle>>,
    idle: Mutex<Option<AnimationHandle>>,
}

impl Animations {
    /// Collect the personality servos out of the registry.
    #[must_use]
    pub fn new(
        registry: &ServoRegistry,
        eyelid: Option<Arc<EyelidController>>,
        config: AnimationConfig,
    ) -> Self {
        let mut servos = HashMap::new();
        for name in PERSONALITY_SERVOS {
            if let Some(servo) = registry.find(name) {
                servos.insert((*name).to_string(), servo);
            }
        }
        Self {
            servos,
            pitch: registry.find("NPT"),
            eyelid,
            config,
            listening: Mutex::new(None),
            thinking: Mutex::new(None),
            talking: Mutex::new(None),
            idle: Mutex::new(None),
        }
    }

    fn servo(&self, name: &str) -> Option<Arc<Servo>> {
        self.servos.get(name).cloned()
    }

    /// Curious pose, raised lid and a gentle head-roll sway.
    pub fn start_listening(&self) {
        info!("anim: listen start");
        self.apply_pose("curious");
        if let Some(lids) = &self.eyelid {
            lids.override_fraction(0.0, Duration::from_secs(2));
        }
        let mut slot = self.listening.lock().expect("listening slot");
        if slot.is_some() {
            return;
        }
        let Some(head) = self.servo("NRL") else {
            return;
        };
        let amplitude = self.config.listen_roll_deg;
        *slot = Some(AnimationHandle::spawn("listen", move |stop| {
            let neutral = head.config().neutral_deg;
            let mut toggle = false;
            while !stop.load(Ordering::SeqCst) {
                let offset = if toggle { amplitude } else { -amplitude };
                drive_targets(&[(head.clone(), neutral + offset)], Duration::from_millis(700), &stop);
                toggle = !toggle;
            }
            drive_targets(&[(head.clone(), neutral)], Duration::from_millis(400), &stop);
        }));
    }

    /// Stop the listening sway and drop the lid back to auto.
    pub fn stop_listening(&self) {
        if let Some(handle) = self.listening.lock().expect("listening slot").take() {
            handle.stop();
        }
        if let Some(lids) = &self.eyelid {
            lids.set_mode(crate::eyelid::EyelidMode::Auto);
        }
        self.restore_neutral();
        debug!("anim: listen stop");
    }

    /// Alternating ears plus a slow pitch nod.
    pub fn start_thinking(&self) {
        info!("anim: think start");
        let mut slot = self.thinking.lock().expect("thinking slot");
        if slot.is_some() {
            return;
        }
        let left = self.servo("EAL");
        let right = self.servo("EAR");
        let pitch = self.pitch.clone();
        let eyelid = self.eyelid.clone();
        let ear_amp = self.config.think_ear_deg;
        let nod_amp = self.config.think_nod_deg;
        *slot = Some(AnimationHandle::spawn("think", move |stop| {
            let mut toggle = false;
            while !stop.load(Ordering::SeqCst) {
                if let Some(lids) = &eyelid {
                    lids.override_fraction(0.5, Duration::from_secs(2));
                }
                let mut targets = Vec::new();
                if let Some(ear) = &left {
                    let sign = if toggle { 1.0 } else { -1.0 };
                    targets.push((ear.clone(), clamp_for(ear, ear.config().neutral_deg + sign * ear_amp)));
                }
                if let Some(ear) = &right {
                    let sign = if toggle { -1.0 } else { 1.0 };
                    targets.push((ear.clone(), clamp_for(ear, ear.config().neutral_deg + sign * ear_amp)));
                }
                if let Some(npt) = &pitch {
                    let sign = if toggle { 1.0 } else { 0.0 };
                    targets.push((npt.clone(), clamp_for(npt, npt.config().neutral_deg + sign * nod_amp)));
                }
                drive_targets(&targets, Duration::from_millis(900), &stop);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                drive_targets(&targets, Duration::from_millis(700), &stop);
                toggle = !toggle;
            }
        }));
    }

    /// Stop thinking and settle back to neutral.
    pub fn stop_thinking(&self) {
        if let Some(handle) = self.thinking.lock().expect("thinking slot").take() {
            handle.stop();
        }
        if let Some(lids) = &self.eyelid {
            lids.set_mode(crate::eyelid::EyelidMode::Auto);
        }
        self.restore_neutral();
        debug!("anim: think stop");
    }

    /// Flap the mouth while TTS audio plays.
    pub fn start_talking(&self) {
        // A talk animation taking over from thinking must stop it first so
        // both never drive NPT at once.
        self.stop_thinking();
        info!("anim: talk start");
        let mut slot = self.talking.lock().expect("talking slot");
        if slot.is_some() {
            return;
        }
        let Some(mouth) = self.servo("MOU") else {
            return;
        };
        let step = Duration::from_millis(self.config.mouth_step_ms);
        *slot = Some(AnimationHandle::spawn("talk", move |stop| {
            let rest = mouth.config().neutral_deg;
            let open = clamp_for(&mouth, rest - 40.0);
            let close = clamp_for(&mouth, rest - 10.0);
            let mut toggle = false;
            while !stop.load(Ordering::SeqCst) {
                let target = if toggle { open } else { close };
                drive_targets(&[(mouth.clone(), target)], step, &stop);
                toggle = !toggle;
            }
            drive_targets(&[(mouth.clone(), rest)], Duration::from_millis(150), &stop);
        }));
    }

    /// Stop the mouth loop and rest it at neutral.
    pub fn stop_talking(&self) {
        if let Some(handle) = self.talking.lock().expect("talking slot").take() {
            handle.stop();
        }
        if let Some(mouth) = self.servo("MOU") {
            mouth.move_to_neutral();
        }
        debug!("anim: talk stop");
    }

    /// Random single-servo fidgets while waiting for the wake word.
    pub fn start_idle(&self) {
        let mut slot = self.idle.lock().expect("idle slot");
        if slot.is_some() {
            return;
        }
        let candidates: Vec<Arc<Servo>> = ["EAL", "EAR", "NRL"]
            .iter()
            .filter_map(|name| self.servo(name))
            .collect();
        if candidates.is_empty() {
            return;
        }
        *slot = Some(AnimationHandle::spawn("idle", move |stop| {
            let mut rng = rand::thread_rng();
            sleep_with_stop(Duration::from_secs_f64(rng.gen_range(2.0..5.0)), &stop);
            while !stop.load(Ordering::SeqCst) {
                sleep_with_stop(Duration::from_secs_f64(rng.gen_range(5.0..10.0)), &stop);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(servo) = candidates.choose(&mut rng).cloned() else {
                    break;
                };
                let neutral = servo.config().neutral_deg;
                let offset = *[-12.0, 12.0].choose(&mut rng).unwrap_or(&12.0);
                drive_targets(
                    &[(servo.clone(), clamp_for(&servo, neutral + offset))],
                    Duration::from_millis(300),
                    &stop,
                );
                drive_targets(&[(servo, neutral)], Duration::from_millis(300), &stop);
            }
        }));
        debug!("anim: idle start");
    }

    /// Stop the idle fidgets.
    pub fn stop_idle(&self) {
        if let Some(handle) = self.idle.lock().expect("idle slot").take() {
            handle.stop();
        }
        self.restore_neutral();
    }

    /// Apply a named pose to the available personality servos.
    pub fn apply_pose(&self, name: &str) {
        for (servo_name, angle) in pose(name) {
            if let Some(servo) = self.servo(servo_name) {
                servo.set_target(clamp_for(&servo, *angle));
            } else if *servo_name == "LID" {
                if let Some(lids) = &self.eyelid {
                    lids.set_override(*angle, Duration::from_secs(2));
                }
            }
        }
        self.tick_servos(Duration::from_millis(50), 3);
    }

    /// Target every personality servo at its neutral angle.
    pub fn restore_neutral(&self) {
        for servo in self.servos.values() {
            servo.move_to_neutral();
        }
        self.tick_servos(Duration::from_millis(50), 3);
    }

    /// Stop every running animation (idempotent).
    pub fn stop_all(&self) {
        self.stop_listening();
        self.stop_thinking();
        self.stop_talking();
        self.stop_idle();
    }

    fn tick_servos(&self, dt: Duration, steps: usize) {
        for _ in 0..steps {
            for servo in self.servos.values() {
                let _ = servo.advance(dt);
            }
        }
    }
}

fn clamp_for(servo: &Arc<Servo>, angle: f64) -> f64 {
    angle.clamp(servo.config().min_angle_deg, servo.config().max_angle_deg)
}

fn drive_targets(targets: &[(Arc<Servo>, f64)], duration: Duration, stop: &AtomicBool) {
    for (servo, angle) in targets {
        servo.set_target(*angle);
    }
    let step = ANIM_TICK.min(Duration::from_millis(20));
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        for (servo, _) in targets {
            let _ = servo.advance(step);
        }
        std::thread::sleep(step);
    }
}

fn sleep_with_stop(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, SharedBus};
    use crate::calibration::ServoCalibration;
    use crate::layout::layout_v1;
    use crate::registry::ServoRegistryBuilder;
    use std::collections::HashMap as StdHashMap;

    fn registry() -> ServoRegistry {
        let mock = Arc::new(Mutex::new(MockBus::new()));
        let bus: SharedBus = mock;
        let mut builder =
            ServoRegistryBuilder::new(bus, StdHashMap::<u8, ServoCalibration>::new());
        builder.register_all(&layout_v1()).unwrap();
        builder.build()
    }

    #[test]
    fn talking_toggles_and_rests_the_mouth() {
        let registry = registry();
        let animations = Animations::new(&registry, None, AnimationConfig {
            mouth_step_ms: 20,
            ..AnimationConfig::default()
        });
        let mouth = registry.get("MOU").unwrap();

        animations.start_talking();
        std::thread::sleep(Duration::from_millis(80));
        // Mid-animation the mouth is away from its rest angle.
        assert!(mouth.target() < mouth.config().neutral_deg - 1.0);

        animations.stop_talking();
        assert!((mouth.target() - mouth.config().neutral_deg).abs() < 1e-6);
    }

    #[test]
    fn stop_is_idempotent() {
        let registry = registry();
        let animations = Animations::new(&registry, None, AnimationConfig::default());
        animations.start_thinking();
        animations.stop_thinking();
        animations.stop_thinking();
        animations.stop_all();
    }

    #[test]
    fn thinking_moves_ears_and_restores_neutral() {
        let registry = registry();
        let animations = Animations::new(&registry, None, AnimationConfig::default());
        let left_ear = registry.get("EAL").unwrap();

        animations.start_thinking();
        std::thread::sleep(Duration::from_millis(120));
        let moved = (left_ear.target() - left_ear.config().neutral_deg).abs() > 1.0;
        animations.stop_thinking();

        assert!(moved, "thinking loop never moved the ear");
        assert!((left_ear.target() - left_ear.config().neutral_deg).abs() < 1e-6);
    }

    #[test]
    fn double_start_keeps_single_thread() {
        let registry = registry();
        let animations = Animations::new(&registry, None, AnimationConfig::default());
        animations.start_talking();
        animations.start_talking();
        assert!(animations.talking.lock().unwrap().is_some());
        animations.stop_talking();
        assert!(animations.talking.lock().unwrap().is_none());
    }

    #[test]
    fn pose_targets_available_servos() {
        let registry = registry();
        let animations = Animations::new(&registry, None, AnimationConfig::default());
        animations.apply_pose("curious");
        let head = registry.get("NRL").unwrap();
        assert!((head.target() - (-10.0)).abs() < 1e-6);
    }
}
