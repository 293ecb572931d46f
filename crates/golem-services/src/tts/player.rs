//! Local audio playback for the subprocess TTS fallback.

use crate::error::{Result, ServiceError};
use rodio::{Decoder, OutputStream, Sink};
use std::io::Cursor;
use tracing::debug;

/// Decode and play an in-memory WAV, blocking until playback ends.
///
/// The output stream handle is not `Send`, so callers run this inside
/// `spawn_blocking`.
pub fn play_wav_blocking(audio: Vec<u8>) -> Result<()> {
    let (_stream, handle) = OutputStream::try_default()
        .map_err(|e| ServiceError::Tts(format!("output device: {e}")))?;
    let source = Decoder::new(Cursor::new(audio))
        .map_err(|e| ServiceError::Tts(format!("decode: {e}")))?;
    let sink = Sink::try_new(&handle).map_err(|e| ServiceError::Tts(format!("sink: {e}")))?;
    sink.append(source);
    sink.sleep_until_end();
    debug!("local playback finished");
    Ok(())
}
