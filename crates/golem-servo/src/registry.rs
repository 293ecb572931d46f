//! Process-wide servo registry.

use crate::bus::SharedBus;
use crate::calibration::{merge_calibration, ServoCalibration};
use crate::error::{Result, ServoError};
use crate::layout::ServoDefinition;
use crate::servo::Servo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The `name -> Servo` map built at startup from layout plus calibration.
///
/// Immutable after construction; every subsystem gets `Arc<Servo>` handles
/// out of it and never registers servos of its own.
pub struct ServoRegistry {
    servos: HashMap<String, Arc<Servo>>,
    park_angles: HashMap<String, f64>,
}

/// Builder enforcing unique names and channels while the registry forms.
pub struct ServoRegistryBuilder {
    bus: SharedBus,
    calibration: HashMap<u8, ServoCalibration>,
    servos: HashMap<String, Arc<Servo>>,
    channels: HashMap<u8, String>,
    park_angles: HashMap<String, f64>,
}

impl ServoRegistryBuilder {
    /// Start a registry on the given bus with a calibration overlay.
    #[must_use]
    pub fn new(bus: SharedBus, calibration: HashMap<u8, ServoCalibration>) -> Self {
        Self {
            bus,
            calibration,
            servos: HashMap::new(),
            channels: HashMap::new(),
            park_angles: HashMap::new(),
        }
    }

    /// Register one servo from its layout definition.
    pub fn register(&mut self, definition: &ServoDefinition) -> Result<()> {
        if self.servos.contains_key(definition.name) {
            return Err(ServoError::Registry(format!(
                "duplicate servo name {}",
                definition.name
            )));
        }
        if let Some(taken) = self.channels.get(&definition.channel) {
            return Err(ServoError::Registry(format!(
                "channel {} already bound to {taken}",
                definition.channel
            )));
        }

        let calibration = self.calibration.get(&definition.channel);
        let config = merge_calibration(&definition.config, calibration);
        let park = calibration
            .map(ServoCalibration::clamped_stop)
            .unwrap_or(config.neutral_deg);

        let servo = Servo::new(definition.name, definition.channel, config, self.bus.clone())?;
        info!(
            servo = definition.name,
            channel = definition.channel,
            start_deg = servo.config().neutral_deg,
            calibrated = calibration.is_some(),
            "servo registered"
        );
        self.channels.insert(definition.channel, definition.name.to_string());
        self.park_angles.insert(definition.name.to_string(), park);
        self.servos.insert(definition.name.to_string(), Arc::new(servo));
        Ok(())
    }

    /// Register the whole layout.
    pub fn register_all(&mut self, layout: &[ServoDefinition]) -> Result<()> {
        for definition in layout {
            self.register(definition)?;
        }
        Ok(())
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> ServoRegistry {
        ServoRegistry {
            servos: self.servos,
            park_angles: self.park_angles,
        }
    }
}

impl ServoRegistry {
    /// Look up a servo handle by layout name.
    pub fn get(&self, name: &str) -> Result<Arc<Servo>> {
        self.servos
            .get(name)
            .cloned()
            .ok_or_else(|| ServoError::UnknownServo(name.to_string()))
    }

    /// Like [`get`](Self::get) but optional, for servos disabled by config.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Servo>> {
        self.servos.get(name).cloned()
    }

    /// All registered servos.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Servo>> {
        self.servos.values()
    }

    /// Number of registered servos.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servos.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servos.is_empty()
    }

    /// Drive every servo to its calibrated park angle.
    ///
    /// Used during shutdown; bounded by `timeout` so a wedged bus cannot
    /// stall process exit.
    pub fn park(&self, timeout: Duration) {
        info!("parking servos to calibrated stop angles");
        for (name, servo) in &self.servos {
            let target = self.park_angles.get(name).copied().unwrap_or_else(|| {
                servo.config().neutral_deg
            });
            servo.set_target(target);
        }

        let deadline = Instant::now() + timeout;
        let step = Duration::from_millis(20);
        loop {
            let mut settled = true;
            for servo in self.servos.values() {
                if let Err(e) = servo.advance(step) {
                    debug!(servo = servo.name(), error = %e, "park tick failed");
                }
                if !servo.is_settled(1.5) {
                    settled = false;
                }
            }
            if settled || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(step);
        }
        info!("servos parked");
    }

    /// Release every PWM channel to its safe no-pulse state.
    pub fn release_all(&self) {
        for servo in self.servos.values() {
            if let Err(e) = servo.release() {
                warn!(servo = servo.name(), error = %e, "channel release failed");
            }
        }
        info!("PWM channels released");
    }

    /// Park then release; the common teardown for tools and tests.
    pub fn park_all(&self, timeout: Duration) {
        self.park(timeout);
        self.release_all();
    }
}
