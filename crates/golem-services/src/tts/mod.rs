//! Text-to-speech output.
//!
//! Backends share one capability surface (`say`/`cancel` plus lifecycle
//! states in a shared registry); the [`Speaker`] picks the preferred
//! transport at startup and falls down the chain per utterance when a
//! backend refuses.

mod backend;
mod fifo;
mod mqtt;
mod player;
mod subprocess;

pub use backend::{StatusRegistry, TtsBackend, TtsState};
pub use fifo::{FifoTts, FifoTtsConfig};
pub use mqtt::{MqttTts, MqttTtsConfig};
pub use subprocess::{SubprocessTts, SubprocessTtsConfig};

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Speaker tuning used for duration estimates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpeakerConfig {
    #[serde(default = "default_wpm")]
    pub wpm: u32,
    #[serde(default = "default_punct_pause_ms")]
    pub punct_pause_ms: u32,
}

fn default_wpm() -> u32 {
    185
}

fn default_punct_pause_ms() -> u32 {
    180
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            wpm: default_wpm(),
            punct_pause_ms: default_punct_pause_ms(),
        }
    }
}

/// Handle to one queued utterance.
#[derive(Debug, Clone)]
pub struct TtsJob {
    pub id: String,
    /// Worst-case speech duration, used when status events go missing.
    pub estimate: Duration,
}

/// Speech-output capability consumed by the dialogue controller.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Queue an utterance, returning its id and duration estimate.
    async fn say(&self, text: &str) -> Result<TtsJob>;

    /// Cancel an utterance (barge-in).
    async fn cancel(&self, id: &str) -> Result<()>;

    /// Current lifecycle state of an utterance.
    fn state(&self, id: &str) -> Option<TtsState>;

    /// Block until the utterance terminates or `timeout` passes.
    fn wait_terminal(&self, id: &str, timeout: Duration) -> Option<TtsState>;

    /// Drop tracking state for a finished utterance.
    fn clear(&self, id: &str);
}

/// Backend-selecting speaker.
pub struct Speaker {
    backends: Vec<Arc<dyn TtsBackend>>,
    registry: StatusRegistry,
    config: SpeakerConfig,
}

impl Speaker {
    /// Speaker with no backends; add them in preference order.
    #[must_use]
    pub fn new(registry: StatusRegistry, config: SpeakerConfig) -> Self {
        Self {
            backends: Vec::new(),
            registry,
            config,
        }
    }

    /// Append a backend to the fallback chain.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn TtsBackend>) -> Self {
        info!(backend = backend.name(), "TTS backend registered");
        self.backends.push(backend);
        self
    }

    /// Number of registered backends.
    #[must_use]
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Estimated speech duration for a text.
    #[must_use]
    pub fn estimate(&self, text: &str) -> Duration {
        estimate_speech(text, self.config.wpm, self.config.punct_pause_ms)
    }
}

#[async_trait]
impl SpeechOutput for Speaker {
    async fn say(&self, text: &str) -> Result<TtsJob> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let estimate = self.estimate(text);

        for backend in &self.backends {
            if !backend.is_available() {
                continue;
            }
            match backend.say(&id, text).await {
                Ok(()) => {
                    return Ok(TtsJob {
                        id,
                        estimate,
                    });
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "TTS backend failed, trying next");
                }
            }
        }
        Err(ServiceError::AllTtsBackendsFailed)
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        for backend in &self.backends {
            if backend.is_available() {
                return backend.cancel(id).await;
            }
        }
        Ok(())
    }

    fn state(&self, id: &str) -> Option<TtsState> {
        self.registry.get(id)
    }

    fn wait_terminal(&self, id: &str, timeout: Duration) -> Option<TtsState> {
        self.registry.wait_terminal(id, timeout)
    }

    fn clear(&self, id: &str) {
        self.registry.clear(id);
    }
}

/// Estimate how long a text takes to speak.
///
/// Word count at the configured speaking rate plus pause time for
/// sentence and clause punctuation, with a fixed engine latency pad.
#[must_use]
pub fn estimate_speech(text: &str, wpm: u32, punct_pause_ms: u32) -> Duration {
    let words = text
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
        .max(1);
    let base = words as f64 * 60.0 / f64::from(wpm.max(60));

    let count = |set: &[char]| text.chars().filter(|c| set.contains(c)).count() as f64;
    let pauses = count(&['.', '!', '?', '…']);
    let commas = count(&[',', ';', ':']);
    let pause_s = f64::from(punct_pause_ms) / 1000.0;
    let extra = pauses * pause_s + commas * pause_s / 2.0;

    Duration::from_secs_f64(base + extra + 0.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyBackend {
        name: &'static str,
        available: AtomicBool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(name: &'static str, available: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                available: AtomicBool::new(available),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TtsBackend for FlakyBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn say(&self, _id: &str, _text: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ServiceError::Tts("synthetic failure".to_string()))
            } else {
                Ok(())
            }
        }

        async fn cancel(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn speaker_falls_through_failed_backends() {
        let primary = FlakyBackend::new("primary", true, true);
        let fallback = FlakyBackend::new("fallback", true, false);
        let speaker = Speaker::new(StatusRegistry::new(), SpeakerConfig::default())
            .with_backend(primary.clone())
            .with_backend(fallback.clone());

        let job = speaker.say("hello there").await.unwrap();
        assert_eq!(job.id.len(), 12);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_backends_are_skipped() {
        let offline = FlakyBackend::new("offline", false, false);
        let online = FlakyBackend::new("online", true, false);
        let speaker = Speaker::new(StatusRegistry::new(), SpeakerConfig::default())
            .with_backend(offline.clone())
            .with_backend(online.clone());

        speaker.say("hi").await.unwrap();
        assert_eq!(offline.calls.load(Ordering::SeqCst), 0);
        assert_eq!(online.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_backends_failing_is_an_error() {
        let a = FlakyBackend::new("a", true, true);
        let b = FlakyBackend::new("b", false, false);
        let speaker = Speaker::new(StatusRegistry::new(), SpeakerConfig::default())
            .with_backend(a)
            .with_backend(b);
        let result = speaker.say("hi").await;
        assert!(matches!(result, Err(ServiceError::AllTtsBackendsFailed)));
    }

    #[test]
    fn estimates_scale_with_length_and_punctuation() {
        let short = estimate_speech("hi", 185, 180);
        let long = estimate_speech(
            "this is a considerably longer sentence with many more words in it",
            185,
            180,
        );
        assert!(long > short);

        let flat = estimate_speech("one two three", 185, 180);
        let punctuated = estimate_speech("one, two. three!", 185, 180);
        assert!(punctuated > flat);
    }

    #[test]
    fn estimate_has_latency_floor() {
        assert!(estimate_speech("", 185, 180) >= Duration::from_millis(200));
    }
}
