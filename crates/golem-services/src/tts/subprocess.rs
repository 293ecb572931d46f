//! One-shot subprocess TTS fallback.
//!
//! Last resort when neither the MQTT engine nor the warm pipe server is
//! reachable: run a synthesis command, read WAV from its stdout and play
//! it on the local audio device.

use crate::error::{Result, ServiceError};
use crate::tts::backend::{StatusRegistry, TtsBackend, TtsState};
use crate::tts::player::play_wav_blocking;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Synthesis command configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubprocessTtsConfig {
    /// Synthesizer executable; reads text on stdin, writes WAV to stdout.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_command() -> String {
    "piper".to_string()
}

impl Default for SubprocessTtsConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
        }
    }
}

/// TTS backend spawning one synthesis process per utterance.
pub struct SubprocessTts {
    config: SubprocessTtsConfig,
    registry: StatusRegistry,
    active: Arc<Mutex<Option<(String, Child)>>>,
}

impl SubprocessTts {
    #[must_use]
    pub fn new(config: SubprocessTtsConfig, registry: StatusRegistry) -> Self {
        Self {
            config,
            registry,
            active: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl TtsBackend for SubprocessTts {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn say(&self, id: &str, text: &str) -> Result<()> {
        self.registry.set(id, TtsState::Start);
        info!(id, command = %self.config.command, "spawning synthesis process");

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                self.registry.set(id, TtsState::Error);
                ServiceError::Tts(format!("spawn {}: {e}", self.config.command))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{text}\n");
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ServiceError::Tts(format!("stdin: {e}")))?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::Tts("no stdout from synthesizer".to_string()))?;
        {
            let mut active = self.active.lock().await;
            *active = Some((id.to_string(), child));
        }

        let registry = self.registry.clone();
        let active = self.active.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut audio = Vec::new();
            let mut stdout = stdout;
            let read = stdout.read_to_end(&mut audio).await;

            let status = {
                let mut guard = active.lock().await;
                match guard.take() {
                    Some((_, mut child)) => child.wait().await.ok(),
                    None => None,
                }
            };

            let synth_ok = read.is_ok()
                && status.map(|s| s.success()).unwrap_or(false)
                && !audio.is_empty();
            if !synth_ok {
                error!(id, "synthesis process failed");
                registry.set(&id, TtsState::Error);
                return;
            }

            registry.set(&id, TtsState::Speaking);
            debug!(id, bytes = audio.len(), "playing synthesized audio");
            let played = tokio::task::spawn_blocking(move || play_wav_blocking(audio)).await;
            match played {
                Ok(Ok(())) => registry.set(&id, TtsState::Done),
                _ => registry.set(&id, TtsState::Error),
            }
        });
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some((active_id, child)) = active.as_mut() {
            if active_id == id {
                let _ = child.start_kill();
                self.registry.set(id, TtsState::Cancelled);
            }
        }
        Ok(())
    }
}
