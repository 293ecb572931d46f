//! Dialogue controller.
//!
//! The top-level state machine gluing wake detection, endpointed
//! recording, STT, the chat model and TTS together, while driving the
//! personality animations and the status indicator. Runs on a dedicated
//! thread that owns the microphone pipeline; external service calls go
//! through the async runtime handle at the narrow seams.

use crate::config::DialogueConfig;
use crate::indicator::{RobotState, StatusIndicator};
use crate::memory::ConversationMemory;
use golem_audio::{
    EndpointOutcome, Microphone, SpeechEndpoint, TtsGate, Utterance, VadEngine, WakeWordDetector,
};
use golem_servo::{Animations, EyelidController, EyelidMode};
use golem_services::{ChatModel, SpeechOutput, SpeechToText, TtsState};
use golem_vision::FaceTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Spoken when an external service fails mid-turn. Compiled in so it
/// survives even a broken configuration store.
const FALLBACK_ERROR_PHRASE: &str =
    "Sorry, I ran into a problem. Let's try that again in a moment.";

/// Grace period for the TTS engine to reach `SPEAKING` before the mouth
/// animation starts anyway.
const TTS_START_GRACE: Duration = Duration::from_secs(5);

/// Shortest recording accepted as an actual utterance.
const MIN_UTTERANCE_SECS: f64 = 0.2;

/// Pluggable VAD construction, used to freeze endpointing in tests.
pub type VadFactory = Arc<dyn Fn() -> Box<dyn VadEngine> + Send + Sync>;

/// Dialogue state, driven through
/// `Idle -> Waking -> Listening -> Recording -> Thinking -> Speaking ->
/// Followup` with `DeepSleep` entered after prolonged idleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Idle,
    Waking,
    Listening,
    Recording,
    Thinking,
    Speaking,
    Followup,
    DeepSleep,
}

enum TurnOutcome {
    /// Assistant answered; follow-up may continue.
    Answered,
    /// Nothing usable was heard.
    Silence,
    /// The user asked to shut the program down.
    Exit,
}

/// Everything the controller owns.
pub struct DialogueController {
    config: DialogueConfig,
    handle: Handle,
    mic: Arc<dyn Microphone>,
    wake: WakeWordDetector,
    endpoint: SpeechEndpoint,
    vad_factory: Option<VadFactory>,
    gate: TtsGate,
    speaker: Arc<dyn SpeechOutput>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn ChatModel>,
    animations: Arc<Animations>,
    eyelid: Option<Arc<EyelidController>>,
    tracker: Option<Arc<FaceTracker>>,
    indicator: Arc<dyn StatusIndicator>,
    memory: ConversationMemory,
    stop: Arc<AtomicBool>,
    state: DialogueState,
}

/// Constructor argument bundle; every collaborator is injected.
pub struct DialogueParts {
    pub config: DialogueConfig,
    pub handle: Handle,
    pub mic: Arc<dyn Microphone>,
    pub wake: WakeWordDetector,
    pub endpoint: SpeechEndpoint,
    pub vad_factory: Option<VadFactory>,
    pub gate: TtsGate,
    pub speaker: Arc<dyn SpeechOutput>,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn ChatModel>,
    pub animations: Arc<Animations>,
    pub eyelid: Option<Arc<EyelidController>>,
    pub tracker: Option<Arc<FaceTracker>>,
    pub indicator: Arc<dyn StatusIndicator>,
    pub stop: Arc<AtomicBool>,
}

impl DialogueController {
    /// Assemble the controller.
    #[must_use]
    pub fn new(parts: DialogueParts) -> Self {
        let memory = ConversationMemory::new(parts.config.ctx_turns, &parts.config.system_prompt);
        Self {
            memory,
            config: parts.config,
            handle: parts.handle,
            mic: parts.mic,
            wake: parts.wake,
            endpoint: parts.endpoint,
            vad_factory: parts.vad_factory,
            gate: parts.gate,
            speaker: parts.speaker,
            stt: parts.stt,
            llm: parts.llm,
            animations: parts.animations,
            eyelid: parts.eyelid,
            tracker: parts.tracker,
            indicator: parts.indicator,
            stop: parts.stop,
            state: DialogueState::Idle,
        }
    }

    fn set_state(&mut self, state: DialogueState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "dialogue transition");
            self.state = state;
        }
    }

    /// Current state, for observability.
    #[must_use]
    pub fn state(&self) -> DialogueState {
        self.state
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Main loop; returns when the stop flag rises or the user asks to
    /// shut down.
    pub fn run(&mut self) {
        info!("dialogue controller running");
        let mut last_activity = Instant::now();
        let mut deep_sleep = false;

        'main: while !self.stopping() {
            self.set_state(DialogueState::Idle);
            if !deep_sleep {
                self.indicator.set_state(RobotState::AwaitWake);
                self.animations.start_idle();
            }

            // Wait for the wake word, dropping into deep sleep when idle
            // for too long.
            info!("waiting for wake word");
            loop {
                if self.stopping() {
                    break 'main;
                }
                let samples = match self.mic.read_samples(self.wake.hop_samples()) {
                    Ok(samples) => samples,
                    Err(e) => {
                        if self.stopping() {
                            break 'main;
                        }
                        error!(error = %e, "microphone read failed");
                        std::thread::sleep(Duration::from_millis(200));
                        continue;
                    }
                };
                match self.wake.push(&samples) {
                    Ok(Some(event)) => {
                        info!(confidence = event.confidence, "wake word detected");
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "wake inference failed"),
                }

                if !deep_sleep
                    && last_activity.elapsed()
                        > Duration::from_secs_f64(self.config.deep_sleep_timeout_s)
                {
                    info!("entering deep sleep");
                    deep_sleep = true;
                    self.set_state(DialogueState::DeepSleep);
                    let nap = self.config.nap_phrase.clone();
                    self.speak(&nap);
                    if let Some(tracker) = &self.tracker {
                        tracker.set_enabled(false);
                    }
                    self.animations.stop_idle();
                    if let Some(eyelid) = &self.eyelid {
                        eyelid.set_mode(EyelidMode::Closed);
                    }
                    self.indicator.set_state(RobotState::Off);
                    self.mic.flush();
                }
            }

            if deep_sleep {
                info!("waking from deep sleep");
                deep_sleep = false;
                self.wake.reset();
                self.mic.flush();
                self.animations.restore_neutral();
                if let Some(eyelid) = &self.eyelid {
                    eyelid.set_mode(EyelidMode::Auto);
                }
                if let Some(tracker) = &self.tracker {
                    tracker.set_enabled(true);
                }
                std::thread::sleep(Duration::from_millis(500));
            }

            last_activity = Instant::now();
            self.animations.stop_idle();
            self.set_state(DialogueState::Waking);
            self.indicator.set_state(RobotState::Listening);

            // Speak the confirmation with the mic locally muted so the
            // prompt is never recorded as user input.
            self.mic.set_listen(false);
            self.mic.flush();
            let confirm = self.config.confirm_phrase.clone();
            self.speak(&confirm);
            std::thread::sleep(Duration::from_secs_f64(self.config.cooldown_after_tts_s));
            self.mic.flush();
            self.mic.set_listen(true);
            self.set_state(DialogueState::Listening);

            if self.config.reset_on_wake {
                self.memory.reset();
            }

            let utterance = match self.record_utterance(None) {
                Some(utterance) => utterance,
                None => continue 'main,
            };
            last_activity = Instant::now();

            match self.handle_turn(utterance) {
                TurnOutcome::Exit => break 'main,
                TurnOutcome::Silence => continue 'main,
                TurnOutcome::Answered => {}
            }
            last_activity = Instant::now();

            // Follow-up window: keep the conversation open without a new
            // wake word until silence or the turn cap.
            if self.config.followup_enable {
                let max_turns = self.config.followup_max_turns;
                let mut turns = 0u32;
                loop {
                    if self.stopping() {
                        break 'main;
                    }
                    if max_turns != 0 && turns >= max_turns {
                        info!(turns, "follow-up turn cap reached");
                        break;
                    }
                    self.set_state(DialogueState::Followup);
                    self.indicator.set_state(RobotState::AwaitFollowup);

                    // Guard against recording our own speech tail.
                    let cooldown = if self.config.barge_in {
                        self.config
                            .followup_cooldown_s
                            .max(self.config.cooldown_after_tts_s)
                    } else {
                        self.config.followup_cooldown_s
                    };
                    if self.config.barge_in {
                        self.mic.set_listen(false);
                    }
                    std::thread::sleep(Duration::from_secs_f64(cooldown));
                    self.mic.flush();
                    if self.config.barge_in {
                        self.mic.set_listen(true);
                    }

                    let arm = Duration::from_secs_f64(self.config.followup_arm_s);
                    let Some(utterance) = self.record_utterance(Some(arm)) else {
                        let phrase = self.config.end_of_conversation_phrase.clone();
                        self.speak(&phrase);
                        break;
                    };
                    last_activity = Instant::now();

                    match self.handle_turn(utterance) {
                        TurnOutcome::Exit => break 'main,
                        TurnOutcome::Silence => {
                            let phrase = self.config.end_of_conversation_phrase.clone();
                            self.speak(&phrase);
                            break;
                        }
                        TurnOutcome::Answered => turns += 1,
                    }
                    last_activity = Instant::now();
                }
            }

            self.indicator.set_state(RobotState::AwaitWake);
            self.mic.flush();
            self.wake.reset();
        }

        self.animations.stop_all();
        self.indicator.set_state(RobotState::Off);
        info!("dialogue controller stopped");
    }

    /// Record one utterance with the listening animation running.
    ///
    /// Returns `None` for silence, cancellation or recordings too short
    /// to be real speech.
    fn record_utterance(&mut self, no_speech_timeout: Option<Duration>) -> Option<Utterance> {
        self.set_state(DialogueState::Recording);
        self.indicator.set_state(RobotState::Listening);
        self.animations.start_listening();

        let result = match &self.vad_factory {
            Some(factory) => {
                let mut vad = factory();
                self.endpoint
                    .record_with(self.mic.as_ref(), vad.as_mut(), no_speech_timeout, &self.stop)
            }
            None => self
                .endpoint
                .record(self.mic.as_ref(), no_speech_timeout, &self.stop),
        };
        self.animations.stop_listening();

        let utterance = match result {
            Ok(utterance) => utterance,
            Err(e) => {
                error!(error = %e, "recording failed");
                return None;
            }
        };

        match utterance.outcome {
            EndpointOutcome::NoSpeech | EndpointOutcome::Cancelled => {
                debug!(outcome = ?utterance.outcome, "no utterance");
                None
            }
            EndpointOutcome::SpeechEnded | EndpointOutcome::MaxUtterance => {
                if utterance.duration_secs(self.mic.sample_rate()) < MIN_UTTERANCE_SECS {
                    debug!("utterance too short, treating as silence");
                    return None;
                }
                Some(utterance)
            }
        }
    }

    /// STT, exit-phrase handling, LLM and the spoken reply for one turn.
    fn handle_turn(&mut self, utterance: Utterance) -> TurnOutcome {
        self.set_state(DialogueState::Thinking);
        self.indicator.set_state(RobotState::Thinking);

        let transcript = self.handle.block_on(
            self.stt
                .transcribe(&utterance.audio, self.mic.sample_rate()),
        );
        let user_text = match transcript {
            Ok(transcript) => transcript.text,
            Err(e) => {
                error!(error = %e, "transcription failed");
                self.speak(FALLBACK_ERROR_PHRASE);
                return TurnOutcome::Silence;
            }
        };
        if user_text.is_empty() {
            return TurnOutcome::Silence;
        }
        info!(text = %user_text, "user said");

        let normalized = normalize_command(&user_text);
        if is_exit_command(&normalized) {
            let goodbye = self.config.goodbye_phrase.clone();
            self.speak(&goodbye);
            return TurnOutcome::Exit;
        }
        if is_end_of_conversation(&normalized) {
            return TurnOutcome::Silence;
        }

        self.memory.add_user(user_text.clone());
        self.animations.start_thinking();
        let messages = self.memory.build_messages(&user_text);
        let reply = self.handle.block_on(self.llm.chat(&messages));
        self.animations.stop_thinking();

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "chat model failed");
                self.speak(FALLBACK_ERROR_PHRASE);
                return TurnOutcome::Silence;
            }
        };
        if reply.is_empty() {
            return TurnOutcome::Silence;
        }

        self.memory.add_assistant(reply.clone());
        info!(chars = reply.len(), "assistant reply");
        self.speak(&reply);
        TurnOutcome::Answered
    }

    /// One full TTS turn under the half-duplex gate.
    fn speak(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let turn = self.gate.begin();

        let job = match self.handle.block_on(self.speaker.say(text)) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "speech output failed");
                turn.finish(self.mic.as_ref(), &mut self.wake);
                return;
            }
        };

        // Wait for audio to actually start before moving the mouth;
        // synthesis of long replies takes a moment.
        let start_deadline = Instant::now() + TTS_START_GRACE;
        while Instant::now() < start_deadline && !self.stopping() {
            match self.speaker.state(&job.id) {
                Some(state) if state == TtsState::Speaking || state.is_terminal() => break,
                _ => std::thread::sleep(Duration::from_millis(50)),
            }
        }

        // Direct field write: the gate guard borrows `self.gate` for the
        // whole turn.
        self.state = DialogueState::Speaking;
        self.indicator.set_state(RobotState::Speaking);
        self.animations.start_talking();

        let hard_timeout = Duration::from_secs(6).max(job.estimate * 2 + Duration::from_secs(2));
        if self.gate.barge_in() {
            // Listen for the wake word while speaking; a hit cancels TTS.
            self.mic.flush();
            self.wake.reset();
            let deadline = Instant::now() + hard_timeout;
            while Instant::now() < deadline && !self.stopping() {
                if self
                    .speaker
                    .state(&job.id)
                    .map(TtsState::is_terminal)
                    .unwrap_or(false)
                {
                    break;
                }
                match self.wake.check_once(self.mic.as_ref()) {
                    Ok(true) => {
                        info!("barge-in: cancelling speech");
                        let _ = self.handle.block_on(self.speaker.cancel(&job.id));
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!(error = %e, "barge-in probe failed");
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        } else {
            let state = self.speaker.wait_terminal(&job.id, hard_timeout);
            if !state.map(TtsState::is_terminal).unwrap_or(false) {
                warn!(id = %job.id, "no terminal TTS status, using estimate");
            }
        }

        self.animations.stop_talking();
        self.speaker.clear(&job.id);
        turn.finish(self.mic.as_ref(), &mut self.wake);
    }

    /// Speak the boot-complete prompt.
    pub fn announce_ready(&mut self) {
        let ready = self.config.ready_phrase.clone();
        self.speak(&ready);
    }
}

/// Lowercase and strip punctuation for command matching.
fn normalize_command(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for ch in text.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            normalized.push(ch);
        } else if !normalized.ends_with(' ') {
            normalized.push(' ');
        }
    }
    normalized.trim().to_string()
}

fn is_exit_command(normalized: &str) -> bool {
    matches!(
        normalized,
        "shut down program" | "shutdown program" | "exit program" | "quit program"
    )
}

fn is_end_of_conversation(normalized: &str) -> bool {
    matches!(
        normalized,
        "thanks" | "thank you" | "stop" | "no thanks" | "goodbye" | "bye"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_normalization_strips_punctuation() {
        assert_eq!(normalize_command("Shut down, program!"), "shut down program");
        assert_eq!(normalize_command("  Thanks.  "), "thanks");
    }

    #[test]
    fn exit_and_end_phrases_match() {
        assert!(is_exit_command("shut down program"));
        assert!(!is_exit_command("shut the window"));
        assert!(is_end_of_conversation("thank you"));
        assert!(!is_end_of_conversation("thank you very much"));
    }
}
