//! Named-pipe TTS transport.
//!
//! Writes line-delimited JSON commands into a FIFO feeding a warm TTS
//! server process. The open is non-blocking: a pipe with no reader is
//! treated as unavailable so the speaker can fall through to the next
//! backend. The pipe carries no status channel, so lifecycle states are
//! synthesized from the speech-duration estimate.

use crate::error::{Result, ServiceError};
use crate::tts::backend::{StatusRegistry, TtsBackend, TtsState};
use crate::tts::estimate_speech;
use async_trait::async_trait;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// FIFO transport configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FifoTtsConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_wpm")]
    pub wpm: u32,
    #[serde(default = "default_punct_pause_ms")]
    pub punct_pause_ms: u32,
}

fn default_path() -> PathBuf {
    PathBuf::from("/run/tts/in.jsonl")
}

fn default_wpm() -> u32 {
    185
}

fn default_punct_pause_ms() -> u32 {
    180
}

impl Default for FifoTtsConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            wpm: default_wpm(),
            punct_pause_ms: default_punct_pause_ms(),
        }
    }
}

/// TTS backend over a named pipe.
pub struct FifoTts {
    config: FifoTtsConfig,
    registry: StatusRegistry,
}

impl FifoTts {
    /// Build the backend; existence of the pipe is checked per call.
    #[must_use]
    pub fn new(config: FifoTtsConfig, registry: StatusRegistry) -> Self {
        Self { config, registry }
    }

    fn write_line(&self, line: &str) -> Result<bool> {
        let path = &self.config.path;
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return Ok(false),
        };
        if !metadata.file_type().is_fifo() {
            warn!(path = %path.display(), "TTS pipe path exists but is not a FIFO");
            return Ok(false);
        }

        // Non-blocking open fails with ENXIO when no reader holds the
        // other end; that is the fall-through signal, not an error.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                info!(path = %path.display(), "TTS pipe has no reader");
                return Ok(false);
            }
            Err(e) => return Err(ServiceError::Tts(format!("pipe open: {e}"))),
        };
        file.write_all(line.as_bytes())
            .map_err(|e| ServiceError::Tts(format!("pipe write: {e}")))?;
        Ok(true)
    }
}

#[async_trait]
impl TtsBackend for FifoTts {
    fn name(&self) -> &str {
        "fifo"
    }

    fn is_available(&self) -> bool {
        std::fs::metadata(&self.config.path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false)
    }

    async fn say(&self, id: &str, text: &str) -> Result<()> {
        let line = format!(
            "{}\n",
            serde_json::json!({ "id": id, "text": text })
        );
        if !self.write_line(&line)? {
            return Err(ServiceError::Tts("TTS pipe unavailable".to_string()));
        }
        debug!(id, chars = text.len(), "utterance queued on pipe");

        // No status channel on the pipe: synthesize the lifecycle from
        // the duration estimate.
        self.registry.set(id, TtsState::Speaking);
        let registry = self.registry.clone();
        let id = id.to_string();
        let estimate = estimate_speech(text, self.config.wpm, self.config.punct_pause_ms);
        tokio::spawn(async move {
            tokio::time::sleep(estimate).await;
            registry.set(&id, TtsState::Done);
        });
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        // The warm server drains the pipe; there is no cancel command.
        self.registry.set(id, TtsState::Cancelled);
        Ok(())
    }
}
