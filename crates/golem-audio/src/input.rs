//! Audio input (microphone capture).
//!
//! A cpal input stream feeds raw little-endian PCM16 into a bounded byte
//! queue. Readers pull exact byte counts; the capture callback honors the
//! instance mute switch and the global half-duplex gate before queueing.

use crate::error::{AudioError, Result};
use crate::gate::ListenGate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bound on buffered capture audio before old frames are dropped.
const MAX_QUEUE_SECS: usize = 10;

/// Window used for input level metering.
const LEVEL_WINDOW_SECS: f64 = 2.0;

/// AGC adjustment step per measurement.
const AGC_STEP_DB: f64 = 0.5;

/// A source of captured microphone audio.
///
/// The recorder implements this; tests feed scripted PCM through the same
/// surface.
pub trait Microphone: Send + Sync {
    /// Capture sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Read exactly `n` bytes of PCM16, blocking until available.
    fn read_bytes(&self, n: usize) -> Result<Vec<u8>>;

    /// Read `n` samples as f32 in [-1, 1] with software gain applied.
    fn read_samples(&self, n: usize) -> Result<Vec<f32>>;

    /// Discard all queued audio.
    fn flush(&self);

    /// Instance-level mute switch (half-duplex guard).
    fn set_listen(&self, enabled: bool);

    /// Bytes currently queued.
    fn queued_bytes(&self) -> usize;
}

/// Microphone configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecorderConfig {
    /// Input device index or name fragment; `None` selects the default.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Software gain in dB applied on the float read path.
    #[serde(default)]
    pub gain_db: f64,
    #[serde(default)]
    pub auto_gain: bool,
    #[serde(default = "default_target_dbfs")]
    pub target_dbfs: f64,
    #[serde(default = "default_max_gain_db")]
    pub max_gain_db: f64,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_target_dbfs() -> f64 {
    -18.0
}

fn default_max_gain_db() -> f64 {
    35.0
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            gain_db: 0.0,
            auto_gain: false,
            target_dbfs: default_target_dbfs(),
            max_gain_db: default_max_gain_db(),
        }
    }
}

struct Inner {
    config: RecorderConfig,
    queue: Mutex<VecDeque<u8>>,
    available: Condvar,
    listen: AtomicBool,
    gate: ListenGate,
    running: AtomicBool,
    /// Gain in milli-dB so it fits an atomic.
    gain_milli_db: AtomicU32,
    level: Mutex<VecDeque<f32>>,
}

impl Inner {
    fn max_queue_bytes(&self) -> usize {
        self.config.sample_rate as usize * 2 * MAX_QUEUE_SECS
    }

    fn gain_db(&self) -> f64 {
        f64::from(self.gain_milli_db.load(Ordering::Relaxed) as i32) / 1000.0
    }

    fn set_gain_db(&self, gain: f64) {
        self.gain_milli_db
            .store((gain * 1000.0) as i32 as u32, Ordering::Relaxed);
    }

    fn lin_gain(&self) -> f32 {
        10f32.powf(self.gain_db() as f32 / 20.0)
    }

    /// Queue one captured chunk; called from the stream callback.
    fn ingest(&self, samples: &[i16]) {
        if !(self.listen.load(Ordering::SeqCst) && self.gate.enabled()) {
            return;
        }

        {
            let mut queue = self.queue.lock().expect("capture queue");
            let cap = self.max_queue_bytes();
            let incoming = samples.len() * 2;
            if queue.len() + incoming > cap {
                let excess = queue.len() + incoming - cap;
                let drain_len = excess.min(queue.len());
                queue.drain(..drain_len);
                debug!(dropped = excess, "capture queue overflow");
            }
            for sample in samples {
                queue.extend(sample.to_le_bytes());
            }
        }
        self.available.notify_all();

        self.meter(samples);
        if self.config.auto_gain {
            self.auto_gain_step();
        }
    }

    fn meter(&self, samples: &[i16]) {
        let mut level = self.level.lock().expect("level buffer");
        let max_len = (LEVEL_WINDOW_SECS * f64::from(self.config.sample_rate)) as usize;
        for sample in samples {
            level.push_back(f32::from(*sample) / 32_768.0);
        }
        while level.len() > max_len {
            level.pop_front();
        }
    }

    fn level_dbfs(&self) -> Option<f64> {
        let level = self.level.lock().expect("level buffer");
        if level.is_empty() {
            return None;
        }
        let gain = self.lin_gain();
        let sum: f64 = level
            .iter()
            .map(|s| {
                let scaled = f64::from(*s) * f64::from(gain);
                scaled * scaled
            })
            .sum();
        let rms = (sum / level.len() as f64 + 1e-12).sqrt();
        Some(20.0 * (rms + 1e-12).log10())
    }

    fn auto_gain_step(&self) {
        let Some(level) = self.level_dbfs() else {
            return;
        };
        let gain = self.gain_db();
        let delta = (self.config.target_dbfs - level).clamp(-AGC_STEP_DB, AGC_STEP_DB);
        let next = (gain + delta).clamp(0.0, self.config.max_gain_db);
        if (next - gain).abs() > f64::EPSILON {
            self.set_gain_db(next);
        }
    }

    fn blocking_read(&self, n: usize) -> Result<Vec<u8>> {
        let mut queue = self.queue.lock().expect("capture queue");
        loop {
            if queue.len() >= n {
                return Ok(queue.drain(..n).collect());
            }
            if !self.running.load(Ordering::SeqCst) {
                return Err(AudioError::Stream("recorder stopped".to_string()));
            }
            let (guard, _timeout) = self
                .available
                .wait_timeout(queue, Duration::from_millis(50))
                .expect("capture queue");
            queue = guard;
        }
    }
}

/// Microphone recorder over a cpal input stream.
///
/// The cpal stream lives on a dedicated capture thread (streams are not
/// `Send`); this handle only carries shared state and is freely shareable
/// across the pipeline threads.
pub struct Recorder {
    inner: Arc<Inner>,
    capture: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Recorder {
    /// Create a recorder bound to the global listen gate.
    #[must_use]
    pub fn new(config: RecorderConfig, gate: ListenGate) -> Self {
        let gain = config.gain_db;
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            listen: AtomicBool::new(true),
            gate,
            running: AtomicBool::new(false),
            gain_milli_db: AtomicU32::new(0),
            level: Mutex::new(VecDeque::new()),
            config,
        });
        inner.set_gain_db(gain);
        Self {
            inner,
            capture: Mutex::new(None),
        }
    }

    /// Open the input device and start capturing.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AudioError::Stream("already recording".to_string()));
        }

        let inner = self.inner.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let handle = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || capture_thread(inner, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *self.capture.lock().expect("capture handle") = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.inner.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.inner.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::Stream("capture thread died".to_string()))
            }
        }
    }

    /// Stop capturing and release the stream.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.available.notify_all();
        if let Some(handle) = self.capture.lock().expect("capture handle").take() {
            let _ = handle.join();
        }
        self.flush();
        info!("audio capture stopped");
    }

    /// Current input level in dBFS over the metering window.
    #[must_use]
    pub fn level_dbfs(&self) -> Option<f64> {
        self.inner.level_dbfs()
    }

    /// Current software gain in dB (moves when AGC is active).
    #[must_use]
    pub fn gain_db(&self) -> f64 {
        self.inner.gain_db()
    }

    #[cfg(test)]
    pub(crate) fn push_test_audio(&self, samples: &[i16]) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.ingest(samples);
    }
}

impl Microphone for Recorder {
    fn sample_rate(&self) -> u32 {
        self.inner.config.sample_rate
    }

    fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        self.inner.blocking_read(n)
    }

    fn read_samples(&self, n: usize) -> Result<Vec<f32>> {
        let bytes = self.inner.blocking_read(n * 2)?;
        let gain = self.inner.lin_gain();
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                (f32::from(sample) / 32_768.0 * gain).clamp(-1.0, 1.0)
            })
            .collect())
    }

    fn flush(&self) {
        self.inner.queue.lock().expect("capture queue").clear();
        self.inner.level.lock().expect("level buffer").clear();
    }

    fn set_listen(&self, enabled: bool) {
        self.inner.listen.store(enabled, Ordering::SeqCst);
    }

    fn queued_bytes(&self) -> usize {
        self.inner.queue.lock().expect("capture queue").len()
    }
}

fn capture_thread(inner: Arc<Inner>, ready: std::sync::mpsc::Sender<Result<()>>) {
    let stream = match build_stream(&inner) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        error!(error = %e, "failed to start capture stream");
        inner.running.store(false, Ordering::SeqCst);
        return;
    }
    while inner.running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

fn build_stream(inner: &Arc<Inner>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = select_device(&host, inner.config.device.as_deref())?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let target_rate = inner.config.sample_rate;
    let mut chosen = None;
    // Prefer a native i16 stream; fall back to f32 with conversion.
    for format in [SampleFormat::I16, SampleFormat::F32] {
        let ranges = device
            .supported_input_configs()
            .map_err(|e| AudioError::Device(format!("input configs: {e}")))?;
        for range in ranges {
            if range.sample_format() == format
                && range.min_sample_rate().0 <= target_rate
                && range.max_sample_rate().0 >= target_rate
            {
                chosen = Some(range.with_sample_rate(SampleRate(target_rate)));
                break;
            }
        }
        if chosen.is_some() {
            break;
        }
    }

    let supported = chosen.ok_or_else(|| {
        AudioError::Device(format!("{device_name} does not support {target_rate} Hz"))
    })?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels as usize;
    info!(
        device = %device_name,
        rate = config.sample_rate.0,
        channels,
        format = ?sample_format,
        "microphone opened"
    );

    let err_fn = |err| error!(error = %err, "audio input error");

    let stream = match sample_format {
        SampleFormat::I16 => {
            let inner = inner.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        ingest_frames(&inner, data, channels);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::Stream(format!("build stream: {e}")))?
        }
        SampleFormat::F32 => {
            let inner = inner.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let converted: Vec<i16> = data
                            .iter()
                            .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
                            .collect();
                        ingest_frames(&inner, &converted, channels);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::Stream(format!("build stream: {e}")))?
        }
        other => {
            return Err(AudioError::Device(format!(
                "unsupported sample format {other:?}"
            )))
        }
    };
    Ok(stream)
}

fn ingest_frames(inner: &Inner, data: &[i16], channels: usize) {
    if channels <= 1 {
        inner.ingest(data);
    } else {
        // Downmix to mono by taking the first channel.
        let mono: Vec<i16> = data.chunks(channels).map(|frame| frame[0]).collect();
        inner.ingest(&mono);
    }
}

fn select_device(host: &cpal::Host, wanted: Option<&str>) -> Result<cpal::Device> {
    let Some(wanted) = wanted else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::Device("no input device found".to_string()));
    };

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::Device(format!("device enumeration: {e}")))?;

    if let Ok(index) = wanted.parse::<usize>() {
        for (position, device) in devices.enumerate() {
            if position == index {
                return Ok(device);
            }
        }
        return Err(AudioError::Device(format!("no input device at index {index}")));
    }

    for device in devices {
        if let Ok(name) = device.name() {
            if name.to_lowercase().contains(&wanted.to_lowercase()) {
                return Ok(device);
            }
        }
    }
    warn!(wanted, "requested input device not found, using default");
    host.default_input_device()
        .ok_or_else(|| AudioError::Device("no input device found".to_string()))
}

/// Encode raw PCM16 into a WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AudioError::Stream(format!("WAV writer: {e}")))?;
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::Stream(format!("WAV sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::Stream(format!("WAV finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Recorder {
        Recorder::new(RecorderConfig::default(), ListenGate::new())
    }

    #[test]
    fn read_bytes_is_exact() {
        let rec = recorder();
        rec.push_test_audio(&[100i16; 480]);
        let bytes = rec.read_bytes(400).unwrap();
        assert_eq!(bytes.len(), 400);
        assert_eq!(rec.queued_bytes(), 480 * 2 - 400);
    }

    #[test]
    fn residual_survives_between_reads() {
        let rec = recorder();
        rec.push_test_audio(&[7i16; 100]);
        let first = rec.read_bytes(150).unwrap();
        let second = rec.read_bytes(50).unwrap();
        assert_eq!(first.len(), 150);
        assert_eq!(second.len(), 50);
        assert_eq!(rec.queued_bytes(), 0);
    }

    #[test]
    fn muted_recorder_drops_frames() {
        let rec = recorder();
        rec.set_listen(false);
        rec.push_test_audio(&[100i16; 160]);
        assert_eq!(rec.queued_bytes(), 0);

        rec.set_listen(true);
        rec.push_test_audio(&[100i16; 160]);
        assert_eq!(rec.queued_bytes(), 320);
    }

    #[test]
    fn global_gate_mutes_capture() {
        let gate = ListenGate::new();
        let rec = Recorder::new(RecorderConfig::default(), gate.clone());
        gate.set_enabled(false);
        rec.push_test_audio(&[100i16; 160]);
        assert_eq!(rec.queued_bytes(), 0);

        gate.set_enabled(true);
        rec.push_test_audio(&[100i16; 160]);
        assert_eq!(rec.queued_bytes(), 320);
    }

    #[test]
    fn flush_clears_queue() {
        let rec = recorder();
        rec.push_test_audio(&[5i16; 320]);
        rec.flush();
        assert_eq!(rec.queued_bytes(), 0);
    }

    #[test]
    fn gain_scales_float_reads() {
        let config = RecorderConfig {
            gain_db: 20.0,
            ..RecorderConfig::default()
        };
        let rec = Recorder::new(config, ListenGate::new());
        rec.push_test_audio(&[1000i16; 16]);
        let samples = rec.read_samples(16).unwrap();
        let expected = 1000.0 / 32_768.0 * 10.0;
        assert!((samples[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn agc_raises_gain_on_quiet_input() {
        let config = RecorderConfig {
            auto_gain: true,
            ..RecorderConfig::default()
        };
        let rec = Recorder::new(config, ListenGate::new());
        for _ in 0..20 {
            rec.push_test_audio(&[50i16; 1600]);
        }
        assert!(rec.gain_db() > 0.0);
        assert!(rec.gain_db() <= 35.0);
    }

    #[test]
    fn wav_header_is_valid() {
        let pcm = vec![0u8; 3200];
        let wav = pcm16_to_wav(&pcm, 16_000).unwrap();
        assert!(wav.len() > 44);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
