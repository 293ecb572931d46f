//! TTS backend capability and shared status registry.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle of one spoken utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    Ready,
    Start,
    Speaking,
    Done,
    Cancelled,
    Error,
}

impl TtsState {
    /// Whether the utterance has finished (in any way).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }

    /// Parse a status-topic state string.
    #[must_use]
    pub fn from_wire(state: &str) -> Option<Self> {
        match state.to_ascii_uppercase().as_str() {
            "READY" => Some(Self::Ready),
            "START" => Some(Self::Start),
            "SPEAKING" => Some(Self::Speaking),
            "DONE" => Some(Self::Done),
            "CANCELLED" => Some(Self::Cancelled),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One TTS engine transport.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Backend name for logs and selection.
    fn name(&self) -> &str;

    /// Whether the transport is currently usable.
    fn is_available(&self) -> bool {
        true
    }

    /// Enqueue an utterance under the given id.
    async fn say(&self, id: &str, text: &str) -> Result<()>;

    /// Cancel a queued or playing utterance.
    async fn cancel(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
struct RegistryInner {
    states: HashMap<String, TtsState>,
}

/// Utterance state shared between backend event pumps and the dialogue
/// thread. Backends write, the dialogue polls or blocks on terminals.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<(Mutex<RegistryInner>, Condvar)>,
}

impl StatusRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state transition; repeated states are ignored.
    pub fn set(&self, id: &str, state: TtsState) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().expect("tts registry");
        if inner.states.get(id) == Some(&state) {
            return;
        }
        inner.states.insert(id.to_string(), state);
        cvar.notify_all();
    }

    /// Current state of an utterance.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TtsState> {
        let (lock, _) = &*self.inner;
        lock.lock().expect("tts registry").states.get(id).copied()
    }

    /// Forget an utterance.
    pub fn clear(&self, id: &str) {
        let (lock, _) = &*self.inner;
        lock.lock().expect("tts registry").states.remove(id);
    }

    /// Block until the utterance reaches a terminal state or `timeout`
    /// elapses; returns the last observed state.
    #[must_use]
    pub fn wait_terminal(&self, id: &str, timeout: Duration) -> Option<TtsState> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut inner = lock.lock().expect("tts registry");
        loop {
            let state = inner.states.get(id).copied();
            if state.map(TtsState::is_terminal).unwrap_or(false) {
                return state;
            }
            let now = Instant::now();
            if now >= deadline {
                return state;
            }
            let (guard, _) = cvar
                .wait_timeout(inner, deadline - now)
                .expect("tts registry");
            inner = guard;
        }
    }
}
