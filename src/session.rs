//! # Session Orchestration
//!
//! The per-connection turn pipeline and its state machine. One turn runs the
//! three stages strictly in sequence (Transcribe, then Complete, then
//! Synthesize) with the event order the client relies on:
//! transcript, reply text, audio header, audio bytes.
//!
//! ## State Machine:
//! - `Idle → Transcribing` on a valid audio frame (≥300ms)
//! - `Transcribing → Completing` on a non-empty transcript, or back to
//!   `Idle` with a "no speech detected" error
//! - `Completing → Synthesizing` always: a completion failure substitutes
//!   the fixed fallback reply and the turn continues
//! - `Synthesizing → Idle` always: a synthesis failure is logged and the
//!   audio events are simply omitted
//! - `StreamIdle ↔ StreamActive` for streaming mode (driven by the socket
//!   handler, not by this pipeline)
//!
//! ## History Policy:
//! The user turn is appended immediately after a non-empty transcript; the
//! assistant turn immediately after Complete resolves (success or fallback)
//! and always before Synthesize runs, so synthesis speaks exactly the text
//! that history recorded.
//!
//! ## Concurrency:
//! The blocking transcription call runs on the blocking pool while holding
//! the engine lock (FIFO across sessions for a shared engine); the network
//! stages are awaited under the configured stage timeout. Nothing here ever
//! blocks another session's event loop.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::audio::frame::duration_seconds;
use crate::conversation::{ConversationHistory, Role};
use crate::pipeline::{run_stage, AgentServices, StageOutcome, FALLBACK_REPLY};
use crate::protocol::ServerEvent;
use crate::transcription::engine::SharedRecognizer;

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Turn-based: waiting for an utterance
    Idle,
    /// Turn-based: stage 1 in flight
    Transcribing,
    /// Turn-based: stage 2 in flight
    Completing,
    /// Turn-based: stage 3 in flight
    Synthesizing,
    /// Streaming: no stream active
    StreamIdle,
    /// Streaming: incremental transcription running
    StreamActive,
}

impl SessionState {
    /// Whether a new turn-based utterance may start from this state.
    pub fn accepts_utterance(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Transcribing => "transcribing",
            SessionState::Completing => "completing",
            SessionState::Synthesizing => "synthesizing",
            SessionState::StreamIdle => "stream_idle",
            SessionState::StreamActive => "stream_active",
        }
    }
}

/// Where the pipeline delivers its output.
///
/// The socket actor implements this by forwarding to the WebSocket context;
/// tests implement it with a collecting recorder. `state` reports every
/// transition the pipeline makes so the owning actor can track it.
pub trait EventSink: Send + Sync {
    fn event(&self, event: ServerEvent);
    fn audio(&self, bytes: Vec<u8>);
    fn state(&self, _state: SessionState) {}
}

/// Run one complete turn: Transcribe → Complete → Synthesize.
///
/// The caller has already validated frame alignment and minimum duration.
/// Every exit path ends with `sink.state(SessionState::Idle)`.
pub async fn run_turn(
    turn: u64,
    samples: Vec<f32>,
    engine: SharedRecognizer,
    history: Arc<Mutex<ConversationHistory>>,
    services: Arc<AgentServices>,
    sink: Arc<dyn EventSink>,
) {
    let audio_seconds = duration_seconds(samples.len());
    sink.state(SessionState::Transcribing);

    // Stage 1: Transcribe. The engine lock queues shared-engine callers in
    // arrival order; inference itself runs on the blocking pool.
    let guard = engine.lock_owned().await;
    let stage = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        let started = Instant::now();
        let text = guard.transcribe_utterance(&samples);
        (text, started.elapsed().as_millis() as u64)
    })
    .await;

    let (text, stt_ms) = match stage {
        Ok((Ok(text), elapsed_ms)) => (text.trim().to_string(), elapsed_ms),
        Ok((Err(err), _)) => {
            warn!(turn, "Transcription failed: {}", err);
            sink.event(ServerEvent::Error {
                message: "Transcription failed".to_string(),
            });
            sink.state(SessionState::Idle);
            return;
        }
        Err(err) => {
            warn!(turn, "Transcription task panicked: {}", err);
            sink.event(ServerEvent::Error {
                message: "Transcription failed".to_string(),
            });
            sink.state(SessionState::Idle);
            return;
        }
    };

    if text.is_empty() {
        sink.event(ServerEvent::Error {
            message: "No speech detected".to_string(),
        });
        sink.state(SessionState::Idle);
        return;
    }

    info!(turn, stt_ms, "Transcript: {}", text);

    // The client sees the transcript now, while stages 2/3 are still pending.
    sink.event(ServerEvent::UserMessage {
        text: text.clone(),
        stt_ms,
        audio_seconds,
    });
    history.lock().unwrap().push(Role::User, text);

    // Stage 2: Complete. Failure degrades to the fixed fallback reply; the
    // turn continues either way so conversational continuity is preserved.
    sink.state(SessionState::Completing);
    let window = history.lock().unwrap().turns();
    let llm_started = Instant::now();
    let outcome = run_stage(services.stage_timeout, services.completion.complete(&window)).await;

    let (reply, llm_ms) = match outcome {
        StageOutcome::Ok { value, elapsed_ms } => (value, elapsed_ms),
        StageOutcome::Failed { reason } => {
            warn!(turn, "Completion stage failed: {}", reason);
            (
                FALLBACK_REPLY.to_string(),
                llm_started.elapsed().as_millis() as u64,
            )
        }
    };

    // Assistant turn is recorded before synthesis so the spoken audio always
    // matches what history holds.
    history.lock().unwrap().push(Role::Assistant, reply.clone());
    info!(turn, llm_ms, "Reply: {}", reply);

    sink.event(ServerEvent::AgentResponse {
        text: reply.clone(),
        llm_ms,
        total_ms: stt_ms + llm_ms,
    });

    // Stage 3: Synthesize. The text reply was already delivered, so failure
    // here only costs the audio.
    sink.state(SessionState::Synthesizing);
    match run_stage(services.stage_timeout, services.synthesis.synthesize(&reply)).await {
        StageOutcome::Ok { value, elapsed_ms } => {
            info!(turn, tts_ms = elapsed_ms, "Synthesized {} bytes", value.len());
            sink.event(ServerEvent::TtsAudio {
                format: services.synthesis.format().to_string(),
                size: value.len(),
            });
            sink.audio(value);
        }
        StageOutcome::Failed { reason } => {
            warn!(turn, "Synthesis stage failed, no audio for this turn: {}", reason);
        }
    }

    sink.state(SessionState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompletionService, SpeechSynthesisService};
    use crate::transcription::engine::{EngineProvider, SpeechRecognizer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Everything a turn produced, in emission order.
    #[derive(Debug, PartialEq)]
    enum Output {
        Event(ServerEvent),
        Audio(Vec<u8>),
        State(SessionState),
    }

    #[derive(Default)]
    struct Recorder {
        outputs: Mutex<Vec<Output>>,
    }

    impl EventSink for Recorder {
        fn event(&self, event: ServerEvent) {
            self.outputs.lock().unwrap().push(Output::Event(event));
        }
        fn audio(&self, bytes: Vec<u8>) {
            self.outputs.lock().unwrap().push(Output::Audio(bytes));
        }
        fn state(&self, state: SessionState) {
            self.outputs.lock().unwrap().push(Output::State(state));
        }
    }

    struct FixedRecognizer {
        text: Result<String, String>,
    }

    impl SpeechRecognizer for FixedRecognizer {
        fn transcribe_utterance(&mut self, _samples: &[f32]) -> anyhow::Result<String> {
            self.text.clone().map_err(|e| anyhow::anyhow!(e))
        }
        fn start(&mut self) {}
        fn feed(&mut self, _samples: &[f32]) {}
        fn poll_partial(&mut self) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        fn finish(&mut self) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct MockCompletion {
        reply: Result<String, String>,
        called: AtomicBool,
    }

    #[async_trait]
    impl CompletionService for MockCompletion {
        async fn complete(&self, _turns: &[crate::conversation::ChatTurn]) -> anyhow::Result<String> {
            self.called.store(true, Ordering::SeqCst);
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct MockSynthesis {
        audio: Result<Vec<u8>, String>,
        spoken: Mutex<Option<String>>,
    }

    #[async_trait]
    impl SpeechSynthesisService for MockSynthesis {
        async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
            *self.spoken.lock().unwrap() = Some(text.to_string());
            self.audio.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct Fixture {
        engine: SharedRecognizer,
        history: Arc<Mutex<ConversationHistory>>,
        services: Arc<AgentServices>,
        completion: Arc<MockCompletion>,
        synthesis: Arc<MockSynthesis>,
        sink: Arc<Recorder>,
    }

    fn fixture(
        transcript: Result<&str, &str>,
        reply: Result<&str, &str>,
        audio: Result<Vec<u8>, &str>,
    ) -> Fixture {
        let transcript = transcript.map(str::to_string).map_err(str::to_string);
        let provider = EngineProvider::per_session(move || {
            Ok(Box::new(FixedRecognizer {
                text: transcript.clone(),
            }) as Box<dyn SpeechRecognizer>)
        });
        let completion = Arc::new(MockCompletion {
            reply: reply.map(str::to_string).map_err(str::to_string),
            called: AtomicBool::new(false),
        });
        let synthesis = Arc::new(MockSynthesis {
            audio: audio.map_err(str::to_string),
            spoken: Mutex::new(None),
        });
        Fixture {
            engine: provider.acquire().unwrap().recognizer().unwrap(),
            history: Arc::new(Mutex::new(ConversationHistory::new(20))),
            services: Arc::new(AgentServices {
                completion: completion.clone(),
                synthesis: synthesis.clone(),
                stage_timeout: Duration::from_secs(1),
            }),
            completion,
            synthesis,
            sink: Arc::new(Recorder::default()),
        }
    }

    async fn run(f: &Fixture) -> Vec<Output> {
        run_turn(
            1,
            vec![0.1f32; 16_000],
            f.engine.clone(),
            f.history.clone(),
            f.services.clone(),
            f.sink.clone(),
        )
        .await;
        std::mem::take(&mut *f.sink.outputs.lock().unwrap())
    }

    #[tokio::test]
    async fn test_full_turn_event_ordering() {
        let f = fixture(Ok("hello there"), Ok("Hi! How can I help?"), Ok(vec![7u8; 4821]));
        let outputs = run(&f).await;

        // transcript → reply text → audio header → audio bytes, with the
        // state machine walking Transcribing → Completing → Synthesizing → Idle.
        let expected = vec![
            Output::State(SessionState::Transcribing),
            Output::Event(ServerEvent::UserMessage {
                text: "hello there".to_string(),
                stt_ms: extract_stt_ms(&outputs),
                audio_seconds: 1.0,
            }),
            Output::State(SessionState::Completing),
            Output::Event(ServerEvent::AgentResponse {
                text: "Hi! How can I help?".to_string(),
                llm_ms: extract_llm_ms(&outputs),
                total_ms: extract_total_ms(&outputs),
            }),
            Output::State(SessionState::Synthesizing),
            Output::Event(ServerEvent::TtsAudio {
                format: "mp3".to_string(),
                size: 4821,
            }),
            Output::Audio(vec![7u8; 4821]),
            Output::State(SessionState::Idle),
        ];
        assert_eq!(outputs, expected);
    }

    fn extract_stt_ms(outputs: &[Output]) -> u64 {
        outputs
            .iter()
            .find_map(|o| match o {
                Output::Event(ServerEvent::UserMessage { stt_ms, .. }) => Some(*stt_ms),
                _ => None,
            })
            .expect("no user_message emitted")
    }

    fn extract_llm_ms(outputs: &[Output]) -> u64 {
        outputs
            .iter()
            .find_map(|o| match o {
                Output::Event(ServerEvent::AgentResponse { llm_ms, .. }) => Some(*llm_ms),
                _ => None,
            })
            .expect("no agent_response emitted")
    }

    fn extract_total_ms(outputs: &[Output]) -> u64 {
        outputs
            .iter()
            .find_map(|o| match o {
                Output::Event(ServerEvent::AgentResponse { total_ms, .. }) => Some(*total_ms),
                _ => None,
            })
            .expect("no agent_response emitted")
    }

    #[tokio::test]
    async fn test_tts_header_size_matches_binary_frame() {
        let f = fixture(Ok("hi"), Ok("hello"), Ok(vec![1, 2, 3, 4, 5]));
        let outputs = run(&f).await;

        let header_size = outputs
            .iter()
            .find_map(|o| match o {
                Output::Event(ServerEvent::TtsAudio { size, .. }) => Some(*size),
                _ => None,
            })
            .unwrap();
        let frame_len = outputs
            .iter()
            .find_map(|o| match o {
                Output::Audio(bytes) => Some(bytes.len()),
                _ => None,
            })
            .unwrap();
        assert_eq!(header_size, frame_len);
        assert_eq!(header_size, 5);
    }

    #[tokio::test]
    async fn test_empty_transcript_aborts_before_completion() {
        let f = fixture(Ok("   "), Ok("never"), Ok(vec![]));
        let outputs = run(&f).await;

        let errors: Vec<_> = outputs
            .iter()
            .filter(|o| matches!(o, Output::Event(ServerEvent::Error { .. })))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            *errors[0],
            Output::Event(ServerEvent::Error {
                message: "No speech detected".to_string()
            })
        );

        assert!(!f.completion.called.load(Ordering::SeqCst));
        assert!(f.history.lock().unwrap().is_empty());
        assert_eq!(outputs.last(), Some(&Output::State(SessionState::Idle)));
    }

    #[tokio::test]
    async fn test_completion_failure_degrades_to_fallback() {
        let f = fixture(Ok("what's the weather"), Err("api down"), Ok(vec![9u8; 10]));
        let outputs = run(&f).await;

        let reply = outputs
            .iter()
            .find_map(|o| match o {
                Output::Event(ServerEvent::AgentResponse { text, .. }) => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reply, FALLBACK_REPLY);

        // History still gains exactly one assistant entry equal to the fallback.
        let history = f.history.lock().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.turns()[1].content, FALLBACK_REPLY);
        drop(history);

        // Synthesis still runs, speaking the fallback text.
        assert_eq!(
            f.synthesis.spoken.lock().unwrap().as_deref(),
            Some(FALLBACK_REPLY)
        );
    }

    #[tokio::test]
    async fn test_synthesis_failure_omits_audio_only() {
        let f = fixture(Ok("hi"), Ok("hello!"), Err("tts down"));
        let outputs = run(&f).await;

        assert!(outputs
            .iter()
            .any(|o| matches!(o, Output::Event(ServerEvent::AgentResponse { .. }))));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, Output::Event(ServerEvent::TtsAudio { .. }))));
        assert!(!outputs.iter().any(|o| matches!(o, Output::Audio(_))));
        assert_eq!(outputs.last(), Some(&Output::State(SessionState::Idle)));

        // The turn itself still counted: both turns recorded.
        assert_eq!(f.history.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transcription_error_emits_single_error() {
        let f = fixture(Err("backend missing"), Ok("never"), Ok(vec![]));
        let outputs = run(&f).await;

        assert_eq!(
            outputs,
            vec![
                Output::State(SessionState::Transcribing),
                Output::Event(ServerEvent::Error {
                    message: "Transcription failed".to_string()
                }),
                Output::State(SessionState::Idle),
            ]
        );
        assert!(f.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_window_caps_at_twenty() {
        let f = fixture(Ok("another question"), Ok("another answer"), Ok(vec![0u8; 4]));
        for _ in 0..13 {
            run(&f).await;
        }
        let history = f.history.lock().unwrap();
        assert_eq!(history.len(), 20);
        // Oldest surviving entry is from a recent turn, order preserved.
        assert_eq!(history.turns()[0].content, "another question");
        assert_eq!(history.turns()[19].content, "another answer");
    }

    #[test]
    fn test_state_machine_gating() {
        assert!(SessionState::Idle.accepts_utterance());
        assert!(!SessionState::Transcribing.accepts_utterance());
        assert!(!SessionState::Completing.accepts_utterance());
        assert!(!SessionState::Synthesizing.accepts_utterance());
        assert!(!SessionState::StreamActive.accepts_utterance());
    }
}
