//! Speech-to-text HTTP client.
//!
//! The transcription service accepts a WAV upload as multipart form
//! field `audio` plus an optional `lang` hint, and answers
//! `{"text": ..., "lang": ...}`. Liveness is probed via `GET /healthz`.

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// STT endpoint configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5005".to_string()
}

fn default_lang() -> String {
    "en".to_string()
}

fn default_timeout_s() -> f64 {
    60.0
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            lang: default_lang(),
            timeout_s: default_timeout_s(),
        }
    }
}

/// A recognized utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    ok: bool,
}

/// Transcription capability, mockable for dialogue tests.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe mono PCM16 audio.
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<Transcript>;
}

/// HTTP client for the remote transcription service.
pub struct SttClient {
    config: SttConfig,
    client: reqwest::Client,
}

impl SttClient {
    /// Build a client with the configured request timeout.
    pub fn new(config: SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Probe `GET /healthz`; an unhealthy service fails startup.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/healthz", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ServiceError::Unhealthy(format!("STT unreachable at {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Unhealthy(format!(
                "STT health returned {}",
                response.status()
            )));
        }
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        if !health.ok {
            return Err(ServiceError::Unhealthy("STT reports ok=false".to_string()));
        }
        info!(url, "STT reachable");
        Ok(())
    }
}

#[async_trait]
impl SpeechToText for SttClient {
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<Transcript> {
        let wav = pcm16_to_wav(pcm, sample_rate)?;
        let url = format!("{}/stt", self.config.base_url.trim_end_matches('/'));
        debug!(bytes = wav.len(), url, "posting audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .map_err(|e| ServiceError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("audio", part)
            .text("lang", self.config.lang.clone());

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::Network(format!("STT request: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::Stt(format!(
                "STT returned {}",
                response.status()
            )));
        }

        let body: SttResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        let text = body.text.unwrap_or_default().trim().to_string();
        debug!(%text, "transcription result");
        Ok(Transcript {
            text,
            lang: body.lang,
        })
    }
}

/// Wrap mono PCM16 into a WAV container for upload.
fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ServiceError::Stt(format!("WAV writer: {e}")))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| ServiceError::Stt(format!("WAV sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ServiceError::Stt(format!("WAV finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_wrapper_produces_riff() {
        let wav = pcm16_to_wav(&[0u8; 640], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte header plus payload.
        assert_eq!(wav.len(), 44 + 640);
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = SttConfig::default();
        assert!(config.base_url.starts_with("http"));
        assert_eq!(config.lang, "en");
    }
}
