//! End-to-end dialogue scenarios with scripted audio and mocked services.
//!
//! The controller runs on its own thread against a scripted microphone,
//! wake scorer and VAD, with STT/LLM/TTS replaced by capturing mocks, so
//! each scenario is deterministic.

use async_trait::async_trait;
use golem::config::DialogueConfig;
use golem::dialogue::{DialogueController, DialogueParts, VadFactory};
use golem::indicator::{RobotState, StatusIndicator};
use golem_audio::{
    AudioError, EndpointConfig, ListenGate, Microphone, SpeechEndpoint, TtsGate, VadEngine,
    WakeConfig, WakeScorer, WakeWordDetector,
};
use golem_servo::{layout_v1, AnimationConfig, Animations, MockBus, ServoRegistryBuilder};
use golem_services::{
    ChatMessage, ChatModel, ServiceError, SpeechOutput, SpeechToText, Transcript, TtsJob, TtsState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------- mocks

/// Endless zero-PCM microphone that tracks mute/flush calls.
struct ScriptedMic {
    listen: AtomicBool,
    flushes: Mutex<u32>,
}

impl ScriptedMic {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listen: AtomicBool::new(true),
            flushes: Mutex::new(0),
        })
    }
}

impl Microphone for ScriptedMic {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn read_bytes(&self, n: usize) -> Result<Vec<u8>, AudioError> {
        // Pace the pipeline a little so the controller loop does not spin.
        std::thread::sleep(Duration::from_micros(200));
        Ok(vec![0u8; n])
    }

    fn read_samples(&self, n: usize) -> Result<Vec<f32>, AudioError> {
        std::thread::sleep(Duration::from_micros(200));
        Ok(vec![0.0; n])
    }

    fn flush(&self) {
        *self.flushes.lock().unwrap() += 1;
    }

    fn set_listen(&self, enabled: bool) {
        self.listen.store(enabled, Ordering::SeqCst);
    }

    fn queued_bytes(&self) -> usize {
        0
    }
}

/// Wake scorer replaying a fixed score sequence, then silence.
struct SequenceScorer {
    scores: Mutex<VecDeque<f32>>,
}

impl WakeScorer for SequenceScorer {
    fn score(&mut self, _window: &[i16]) -> Result<f32, AudioError> {
        Ok(self.scores.lock().unwrap().pop_front().unwrap_or(0.0))
    }
}

struct ReplayVad {
    decisions: VecDeque<bool>,
}

impl VadEngine for ReplayVad {
    fn is_speech(&mut self, _frame: &[u8], _sample_rate: u32) -> bool {
        self.decisions.pop_front().unwrap_or(false)
    }
}

/// One VAD script per recording, in order; silence once exhausted.
fn vad_factory(scripts: Vec<Vec<bool>>) -> VadFactory {
    let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));
    Arc::new(move || {
        let decisions = scripts.lock().unwrap().pop_front().unwrap_or_default();
        Box::new(ReplayVad {
            decisions: decisions.into(),
        })
    })
}

/// An utterance: leading silence, speech, trailing silence.
fn speech_script(speech_frames: usize) -> Vec<bool> {
    let mut script = vec![false; 5];
    script.extend(vec![true; speech_frames]);
    script.extend(vec![false; 20]);
    script
}

struct MockStt {
    texts: Mutex<VecDeque<String>>,
    audio_lens: Mutex<Vec<usize>>,
}

impl MockStt {
    fn new(texts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            texts: Mutex::new(texts.iter().map(|t| t.to_string()).collect()),
            audio_lens: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn transcribe(&self, pcm: &[u8], _sample_rate: u32) -> Result<Transcript, ServiceError> {
        self.audio_lens.lock().unwrap().push(pcm.len());
        let text = self.texts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Transcript { text, lang: None })
    }
}

struct MockLlm {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlm {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for MockLlm {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct MockSpeaker {
    spoken: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, TtsState>>,
    gate: Option<ListenGate>,
    gate_open_during_say: Mutex<Vec<bool>>,
    next_id: Mutex<u32>,
}

impl MockSpeaker {
    fn new(gate: Option<ListenGate>) -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            gate,
            gate_open_during_say: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        })
    }

    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechOutput for MockSpeaker {
    async fn say(&self, text: &str) -> Result<TtsJob, ServiceError> {
        self.spoken.lock().unwrap().push(text.to_string());
        if let Some(gate) = &self.gate {
            self.gate_open_during_say.lock().unwrap().push(gate.enabled());
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("utt-{next:04}")
        };
        self.states.lock().unwrap().insert(id.clone(), TtsState::Done);
        Ok(TtsJob {
            id,
            estimate: Duration::from_millis(10),
        })
    }

    async fn cancel(&self, _id: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    fn state(&self, id: &str) -> Option<TtsState> {
        self.states.lock().unwrap().get(id).copied()
    }

    fn wait_terminal(&self, id: &str, _timeout: Duration) -> Option<TtsState> {
        self.state(id)
    }

    fn clear(&self, id: &str) {
        self.states.lock().unwrap().remove(id);
    }
}

#[derive(Default)]
struct RecordingIndicator {
    states: Mutex<Vec<RobotState>>,
}

impl StatusIndicator for RecordingIndicator {
    fn set_state(&self, state: RobotState) {
        self.states.lock().unwrap().push(state);
    }
}

// -------------------------------------------------------------- harness

struct Harness {
    stop: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
    _runtime: tokio::runtime::Runtime,
}

impl Harness {
    fn finish(self) {
        self.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(self.thread.is_finished(), "dialogue thread hung");
        let _ = self.thread.join();
    }
}

#[allow(clippy::too_many_arguments)]
fn launch(
    dialogue: DialogueConfig,
    wake_scores: Vec<f32>,
    vad_scripts: Vec<Vec<bool>>,
    stt: Arc<MockStt>,
    llm: Arc<MockLlm>,
    speaker: Arc<MockSpeaker>,
    indicator: Arc<RecordingIndicator>,
    gate: ListenGate,
    endpoint_config: EndpointConfig,
) -> Harness {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mock = Arc::new(Mutex::new(MockBus::new()));
    let pwm_bus: golem_servo::SharedBus = mock;
    let mut builder = ServoRegistryBuilder::new(pwm_bus, HashMap::new());
    builder.register_all(&layout_v1()).unwrap();
    let registry = builder.build();
    let animations = Arc::new(Animations::new(&registry, None, AnimationConfig::default()));

    let wake = WakeWordDetector::new(
        WakeConfig {
            threshold: 0.5,
            win_ms: 80,
            hop_ms: 80,
            min_gap_s: 0.0,
            suppress_after_tts_s: 0.01,
            ..WakeConfig::default()
        },
        16_000,
        Box::new(SequenceScorer {
            scores: Mutex::new(wake_scores.into()),
        }),
    );

    let barge_in = dialogue.barge_in;
    let cooldown = Duration::from_secs_f64(dialogue.cooldown_after_tts_s);
    let stop = Arc::new(AtomicBool::new(false));
    let mut controller = DialogueController::new(DialogueParts {
        config: dialogue,
        handle: runtime.handle().clone(),
        mic: ScriptedMic::new(),
        wake,
        endpoint: SpeechEndpoint::new(16_000, endpoint_config),
        vad_factory: Some(vad_factory(vad_scripts)),
        gate: TtsGate::new(gate, barge_in, cooldown),
        speaker,
        stt,
        llm,
        animations,
        eyelid: None,
        tracker: None,
        indicator,
        stop: stop.clone(),
    });

    let thread = std::thread::spawn(move || controller.run());
    Harness {
        stop,
        thread,
        _runtime: runtime,
    }
}

fn test_dialogue_config() -> DialogueConfig {
    DialogueConfig {
        followup_arm_s: 0.3,
        followup_cooldown_s: 0.01,
        cooldown_after_tts_s: 0.02,
        deep_sleep_timeout_s: 300.0,
        ..DialogueConfig::default()
    }
}

fn test_endpoint_config() -> EndpointConfig {
    EndpointConfig {
        end_guard_ms: 0,
        end_hang_ms: 90,
        preroll_ms: 240,
        no_speech_timeout_s: 1.0,
        max_utter_s: 4.0,
        ..EndpointConfig::default()
    }
}

fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

// ------------------------------------------------------------ scenarios

#[test]
fn clean_wake_utterance_and_reply() {
    let gate = ListenGate::new();
    let stt = MockStt::new(&["hello"]);
    let llm = MockLlm::new(&["hi"]);
    let speaker = MockSpeaker::new(None);
    let indicator = Arc::new(RecordingIndicator::default());

    let harness = launch(
        test_dialogue_config(),
        vec![0.9],
        vec![speech_script(15)],
        stt.clone(),
        llm.clone(),
        speaker.clone(),
        indicator.clone(),
        gate,
        test_endpoint_config(),
    );

    // Wake -> confirm -> record -> STT -> LLM -> reply -> silent
    // follow-up window -> end-of-conversation phrase.
    assert!(
        wait_until(Duration::from_secs(10), || speaker.spoken().len() >= 3),
        "conversation never completed: {:?}",
        speaker.spoken()
    );
    harness.finish();

    let spoken = speaker.spoken();
    assert_eq!(spoken[0], "Yes?");
    assert_eq!(spoken[1], "hi");
    assert!(spoken[2].contains("wake word"), "unexpected close: {}", spoken[2]);

    // The chat model saw exactly the transcribed utterance.
    let calls = llm.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].last().unwrap().content, "hello");

    // The recorded utterance was long enough to be real audio.
    let lens = stt.audio_lens.lock().unwrap();
    assert!(lens[0] >= 6400, "utterance too short: {} bytes", lens[0]);

    // Indicator walked through the conversation states.
    let states = indicator.states.lock().unwrap();
    for expected in [
        RobotState::AwaitWake,
        RobotState::Listening,
        RobotState::Thinking,
        RobotState::Speaking,
        RobotState::AwaitFollowup,
    ] {
        assert!(states.contains(&expected), "missing state {expected:?}");
    }
}

#[test]
fn followup_keeps_conversation_history() {
    let gate = ListenGate::new();
    let stt = MockStt::new(&["hello", "and you?"]);
    let llm = MockLlm::new(&["hi", "doing fine"]);
    let speaker = MockSpeaker::new(None);
    let indicator = Arc::new(RecordingIndicator::default());

    let harness = launch(
        test_dialogue_config(),
        vec![0.9],
        vec![speech_script(15), speech_script(15)],
        stt,
        llm.clone(),
        speaker.clone(),
        indicator,
        gate,
        test_endpoint_config(),
    );

    assert!(
        wait_until(Duration::from_secs(12), || llm.call_count() >= 2),
        "second turn never happened"
    );
    harness.finish();

    let calls = llm.calls.lock().unwrap();
    let second = &calls[1];
    // The follow-up context contains the first exchange plus the new turn.
    let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"hello"));
    assert!(contents.contains(&"hi"));
    assert_eq!(second.last().unwrap().content, "and you?");
}

#[test]
fn silence_in_arm_window_returns_to_idle() {
    let gate = ListenGate::new();
    let stt = MockStt::new(&["hello"]);
    let llm = MockLlm::new(&["hi"]);
    let speaker = MockSpeaker::new(None);
    let indicator = Arc::new(RecordingIndicator::default());

    // Only one VAD script: the follow-up window gets pure silence.
    let harness = launch(
        test_dialogue_config(),
        vec![0.9],
        vec![speech_script(15)],
        stt,
        llm.clone(),
        speaker.clone(),
        indicator.clone(),
        gate,
        test_endpoint_config(),
    );

    assert!(
        wait_until(Duration::from_secs(10), || {
            speaker.spoken().iter().any(|t| t.contains("wake word"))
        }),
        "end-of-conversation phrase never spoken"
    );
    // Back to waiting for the wake word.
    assert!(wait_until(Duration::from_secs(5), || {
        let states = indicator.states.lock().unwrap();
        states.iter().filter(|s| **s == RobotState::AwaitWake).count() >= 2
    }));
    harness.finish();
    assert_eq!(llm.call_count(), 1);
}

#[test]
fn endless_speech_is_capped_and_still_answered() {
    let gate = ListenGate::new();
    let stt = MockStt::new(&["tell me everything"]);
    let llm = MockLlm::new(&["that is a long story"]);
    let speaker = MockSpeaker::new(None);
    let indicator = Arc::new(RecordingIndicator::default());

    let endpoint = EndpointConfig {
        max_utter_s: 0.4,
        ..test_endpoint_config()
    };
    // Speech never stops; the absolute cap must end the recording.
    let harness = launch(
        test_dialogue_config(),
        vec![0.9],
        vec![vec![true; 100_000]],
        stt.clone(),
        llm.clone(),
        speaker.clone(),
        indicator,
        gate,
        endpoint,
    );

    assert!(
        wait_until(Duration::from_secs(10), || llm.call_count() >= 1),
        "capped utterance was not processed"
    );
    harness.finish();

    assert!(speaker.spoken().contains(&"that is a long story".to_string()));
    let lens = stt.audio_lens.lock().unwrap();
    assert!(!lens.is_empty() && lens[0] > 0);
}

#[test]
fn half_duplex_mutes_mic_during_speech() {
    let gate = ListenGate::new();
    let stt = MockStt::new(&["hello"]);
    let llm = MockLlm::new(&["hi"]);
    let speaker = MockSpeaker::new(Some(gate.clone()));
    let indicator = Arc::new(RecordingIndicator::default());

    let config = DialogueConfig {
        barge_in: false,
        ..test_dialogue_config()
    };
    let harness = launch(
        config,
        vec![0.9],
        vec![speech_script(15)],
        stt,
        llm,
        speaker.clone(),
        indicator,
        gate.clone(),
        test_endpoint_config(),
    );

    assert!(wait_until(Duration::from_secs(10), || {
        speaker.spoken().len() >= 2
    }));
    harness.finish();

    // Every utterance went out with the global listen gate closed.
    let observations = speaker.gate_open_during_say.lock().unwrap();
    assert!(!observations.is_empty());
    assert!(observations.iter().all(|open| !open));
    // And the gate is open again after the turns finished.
    assert!(gate.enabled());
}
