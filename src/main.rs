//! Golem - voice-assisted animatronic control daemon
//!
//! Boot order: configuration, servo hardware (bus, registry, eyelids),
//! face tracking, startup checks against the external services, audio
//! capture and the wake gate, then the dialogue controller on its own
//! thread. SIGINT/SIGTERM drive a bounded shutdown that parks every
//! servo at its calibrated stop angle and releases the PWM channels.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use golem::config::{AppConfig, ServoSection, TtsSection};
use golem::dialogue::{DialogueController, DialogueParts};
use golem::indicator::{LogIndicator, StatusIndicator};
use golem::startup;
use golem_audio::{
    ListenGate, Recorder, SpeechEndpoint, TtsGate, WakeConfig, WakeWordDetector,
};
use golem_servo::{
    bus, layout_v1, load_calibration, Animations, EyelidController, MockBus, ServoRegistry,
    ServoRegistryBuilder,
};
use golem_services::{
    FifoTts, LlmClient, MqttTts, Speaker, StatusRegistry, SttClient, SubprocessTts,
};
use golem_vision::{FaceTracker, TrackingServos, VisionClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "golem starting");

    let config = AppConfig::load()?;

    // Servo hardware first: a robot that cannot park its actuators safely
    // should not start listening.
    let pwm_bus = build_bus(&config.servo)?;
    let calibration =
        load_calibration(&config.servo.calibration_path).context("loading servo calibration")?;
    let registry = {
        let mut builder = ServoRegistryBuilder::new(pwm_bus, calibration);
        builder
            .register_all(&layout_v1())
            .context("registering servo layout")?;
        Arc::new(builder.build())
    };

    let eyelid = match registry.find("LID") {
        Some(servo) => Some(Arc::new(
            EyelidController::new(servo, config.eyelid.clone()).context("eyelid controller")?,
        )),
        None => None,
    };
    let animations = Arc::new(Animations::new(
        &registry,
        eyelid.clone(),
        config.animation.clone(),
    ));

    let tracker = build_tracker(&config, &registry);

    startup::run_startup_checks(&config).await?;

    let status_registry = StatusRegistry::new();
    let speaker = Arc::new(build_speaker(&config.tts, status_registry).await);

    let gate = ListenGate::new();
    let recorder = Arc::new(Recorder::new(config.audio.clone(), gate.clone()));
    recorder.start().context("starting audio capture")?;

    let wake = build_wake(&config.wake, config.audio.sample_rate);
    let endpoint = SpeechEndpoint::new(config.audio.sample_rate, config.endpoint.clone());
    let tts_gate = TtsGate::new(
        gate,
        config.dialogue.barge_in,
        Duration::from_secs_f64(config.dialogue.cooldown_after_tts_s),
    );

    let stt = Arc::new(SttClient::new(config.stt.clone())?);
    let llm = Arc::new(LlmClient::new(config.llm.clone())?);
    let status: Arc<dyn StatusIndicator> = Arc::new(LogIndicator);

    let stop = Arc::new(AtomicBool::new(false));
    let mut controller = DialogueController::new(DialogueParts {
        config: config.dialogue.clone(),
        handle: tokio::runtime::Handle::current(),
        mic: recorder.clone(),
        wake,
        endpoint,
        vad_factory: None,
        gate: tts_gate,
        speaker,
        stt,
        llm,
        animations: animations.clone(),
        eyelid: eyelid.clone(),
        tracker: tracker.clone(),
        indicator: status,
        stop: stop.clone(),
    });

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let dialogue_thread = std::thread::Builder::new()
        .name("dialogue".to_string())
        .spawn(move || {
            controller.announce_ready();
            controller.run();
            let _ = done_tx.send(());
        })
        .context("spawning dialogue thread")?;

    tokio::select! {
        _ = wait_for_shutdown_signal() => info!("shutdown signal received"),
        _ = done_rx => info!("dialogue controller exited"),
    }

    // Orderly teardown: stop the pipeline, then park the hardware.
    stop.store(true, Ordering::SeqCst);
    recorder.stop();
    join_with_timeout(dialogue_thread, Duration::from_secs(5));

    if let Some(tracker) = &tracker {
        tracker.stop();
    }
    animations.stop_all();
    registry.park(Duration::from_secs(2));
    // Closing the lids last keeps their pose out of the park sweep.
    if let Some(eyelid) = &eyelid {
        eyelid.shutdown();
    }
    registry.release_all();

    info!("golem stopped");
    Ok(())
}

fn build_bus(config: &ServoSection) -> Result<golem_servo::SharedBus> {
    match config.backend.as_str() {
        "mock" => {
            warn!("servo bus in mock mode, no PWM output");
            Ok(bus::shared(MockBus::new()))
        }
        #[cfg(feature = "pca9685")]
        "pca9685" => {
            let driver = golem_servo::Pca9685::open(
                config.i2c_bus,
                config.i2c_address,
                config.pwm_freq_hz,
            )
            .context("opening PCA9685")?;
            Ok(bus::shared(driver))
        }
        #[cfg(not(feature = "pca9685"))]
        "pca9685" => bail!("built without the pca9685 feature; use servo.backend = \"mock\""),
        other => bail!("unknown servo backend {other:?}"),
    }
}

fn build_tracker(config: &AppConfig, registry: &Arc<ServoRegistry>) -> Option<Arc<FaceTracker>> {
    if !config.vision.enabled {
        info!("face tracking disabled by config");
        return None;
    }
    let client = match VisionClient::open(&config.vision.serial_port, config.vision.baud_rate) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "face tracking disabled: vision port unavailable");
            return None;
        }
    };

    let eyes: Vec<_> = ["EYL", "EYR"]
        .iter()
        .filter_map(|name| registry.find(name))
        .collect();
    if eyes.is_empty() {
        warn!("face tracking disabled: no eye servos registered");
        return None;
    }
    let yaw = if config.vision.yaw_enabled {
        // The head-roll servo then belongs to the tracker; personality
        // animations must not fight it.
        warn!("yaw tracking enabled, NRL is driven by the tracker");
        registry.find("NRL")
    } else {
        None
    };
    let servos = TrackingServos {
        eyes,
        yaw,
        pitch: registry.find("NPT"),
        wheels: ["LWH", "RWH"]
            .iter()
            .filter_map(|name| registry.find(name))
            .collect(),
    };
    Some(Arc::new(FaceTracker::start(
        Box::new(client),
        servos,
        config.tracker.clone(),
    )))
}

fn build_wake(config: &WakeConfig, sample_rate: u32) -> WakeWordDetector {
    #[cfg(feature = "onnx-wake")]
    if config.model_path.is_some() {
        match WakeWordDetector::with_onnx(config.clone(), sample_rate) {
            Ok(detector) => return detector,
            Err(e) => warn!(error = %e, "wake model load failed, using energy fallback"),
        }
    }
    WakeWordDetector::with_energy_fallback(config.clone(), sample_rate)
}

async fn build_speaker(config: &TtsSection, registry: StatusRegistry) -> Speaker {
    let mut speaker = Speaker::new(registry.clone(), config.speaker.clone());
    let order: &[&str] = match config.mode.as_str() {
        "fifo" => &["fifo", "subprocess", "mqtt"],
        "subprocess" => &["subprocess"],
        _ => &["mqtt", "fifo", "subprocess"],
    };
    for backend in order {
        match *backend {
            "mqtt" if !config.mqtt.host.is_empty() => {
                match MqttTts::connect(config.mqtt.clone(), registry.clone()).await {
                    Ok(mqtt) => speaker = speaker.with_backend(Arc::new(mqtt)),
                    Err(e) => warn!(error = %e, "MQTT TTS unavailable"),
                }
            }
            "mqtt" => {}
            "fifo" => {
                speaker = speaker
                    .with_backend(Arc::new(FifoTts::new(config.fifo.clone(), registry.clone())));
            }
            "subprocess" => {
                speaker = speaker.with_backend(Arc::new(SubprocessTts::new(
                    config.subprocess.clone(),
                    registry.clone(),
                )));
            }
            _ => {}
        }
    }
    if speaker.backend_count() == 0 {
        warn!("no TTS backend available, the robot will be mute");
    }
    speaker
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn join_with_timeout(handle: std::thread::JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("dialogue thread did not stop in time");
    }
}
