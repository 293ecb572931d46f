//! Shutdown safety: interrupting a running animation must leave every
//! servo at its calibrated stop angle, the lid closed and the PWM
//! channels released.

use golem_servo::{
    layout_v1, AnimationConfig, Animations, EyelidConfig, EyelidController, MockBus,
    ServoCalibration, ServoRegistryBuilder, SharedBus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn teardown_parks_closes_and_releases() {
    let mock = Arc::new(Mutex::new(MockBus::new()));
    let bus: SharedBus = mock.clone();

    let mut calibration = HashMap::new();
    calibration.insert(
        5,
        ServoCalibration {
            channel: 5,
            min_deg: -31.0,
            max_deg: 88.0,
            start_deg: 88.0,
            stop_deg: Some(30.0),
        },
    );

    let mut builder = ServoRegistryBuilder::new(bus, calibration);
    builder.register_all(&layout_v1()).unwrap();
    let registry = Arc::new(builder.build());

    let eyelid = Arc::new(
        EyelidController::new(registry.get("LID").unwrap(), EyelidConfig::default()).unwrap(),
    );
    let animations = Arc::new(Animations::new(
        &registry,
        Some(eyelid.clone()),
        AnimationConfig::default(),
    ));

    // A conversation is mid-flight when the signal arrives.
    animations.start_thinking();
    std::thread::sleep(Duration::from_millis(150));

    // The teardown sequence the daemon runs on SIGTERM.
    animations.stop_all();
    registry.park(Duration::from_secs(1));
    eyelid.shutdown();
    registry.release_all();

    // Calibrated stop angle wins over the preset neutral.
    let mouth = registry.get("MOU").unwrap();
    assert!((mouth.angle() - 30.0).abs() <= 1.5, "mouth at {}", mouth.angle());

    // The lid ended in its closed pose.
    let lid = registry.get("LID").unwrap();
    let closed = -15.0 - 60.0;
    assert!((lid.target() - closed).abs() < 1e-6, "lid at {}", lid.target());

    // Every channel stopped pulsing.
    let released = mock.lock().unwrap().released.clone();
    for channel in 0..10u8 {
        assert!(released.contains(&channel), "channel {channel} still driven");
    }
}
