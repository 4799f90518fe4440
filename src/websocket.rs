//! # WebSocket Connection Handler
//!
//! One actor per client connection, owning that connection's session: its
//! conversation history, its engine handle, and its position in the session
//! state machine. Clients connect to `/ws` and speak the duplex protocol
//! defined in [`crate::protocol`].
//!
//! ## Message Flow:
//! - **Binary frames** carry raw f32 PCM audio. In turn-based mode a frame is
//!   one complete utterance and triggers a full turn; in streaming mode it is
//!   an incremental chunk fed to the streaming worker.
//! - **Text frames** carry control commands (`ping`, `clear_history`,
//!   `start_stream`, `stop_stream`). Unrecognized text is silently dropped.
//!
//! ## Actor Model:
//! The turn pipeline and the streaming worker both run off the actor thread
//! (tokio tasks and the blocking pool) and deliver results back through
//! actor messages, so slow inference never blocks frame handling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::frame::{decode_samples, validate_utterance};
use crate::conversation::ConversationHistory;
use crate::error::{AppError, AppResult};
use crate::pipeline::AgentServices;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::session::{run_turn, EventSink, SessionState};
use crate::state::AppState;
use crate::transcription::engine::{EngineHandle, EnginePolicy, EngineProvider};
use crate::transcription::stream::StreamingTranscript;

/// How often the server pings an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any client frame before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands consumed by the streaming worker thread.
enum StreamCmd {
    Feed(Vec<f32>),
    /// Restart the stream in place: clear accumulated state, re-announce
    Reset,
    Stop,
}

/// What a `start_stream` command does from a given session state.
#[derive(Debug, PartialEq, Eq)]
enum StreamStartAction {
    /// A turn pipeline is in flight; the command is rejected
    Reject,
    /// A stream is already running; it is reset in place
    Restart,
    /// No stream running; a worker is spawned
    Fresh,
}

fn stream_start_action(state: SessionState) -> StreamStartAction {
    match state {
        SessionState::Transcribing | SessionState::Completing | SessionState::Synthesizing => {
            StreamStartAction::Reject
        }
        SessionState::StreamActive => StreamStartAction::Restart,
        SessionState::Idle | SessionState::StreamIdle => StreamStartAction::Fresh,
    }
}

/// WebSocket actor for one voice session.
pub struct VoiceWebSocket {
    /// Unique ID for this connection, used in logs only
    session_id: Uuid,

    /// Current position in the session state machine
    state: SessionState,

    /// Bounded conversation window shared with in-flight turns
    history: Arc<Mutex<ConversationHistory>>,

    /// Completion and synthesis collaborators plus the stage timeout
    services: Arc<AgentServices>,

    /// Where engine handles come from (shared singleton or per-session)
    provider: EngineProvider,

    /// Engine handle for turn-based transcription, acquired on first use
    engine: Option<EngineHandle>,

    /// Sender feeding the streaming worker, present while a stream is active
    stream_tx: Option<std::sync::mpsc::Sender<StreamCmd>>,

    /// Turns started on this connection
    turns: u64,

    /// Last frame received from the client
    last_heartbeat: Instant,

    app_state: web::Data<AppState>,
}

impl VoiceWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let history_turns = app_state.get_config().agent.history_turns;
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Idle,
            history: Arc::new(Mutex::new(ConversationHistory::new(history_turns))),
            services: app_state.services(),
            provider: app_state.engine_provider(),
            engine: None,
            stream_tx: None,
            turns: 0,
            last_heartbeat: Instant::now(),
            app_state,
        }
    }

    fn emit(&self, ctx: &mut ws::WebsocketContext<Self>, event: ServerEvent) {
        if let Ok(json) = serde_json::to_string(&event) {
            ctx.text(json);
        }
    }

    fn emit_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        self.emit(
            ctx,
            ServerEvent::Error {
                message: message.to_string(),
            },
        );
    }

    /// Start one turn-based turn from a complete utterance frame.
    ///
    /// Only called with the session in `Idle`; the pipeline reports its state
    /// transitions back via [`TurnStage`] messages.
    fn begin_turn(&mut self, samples: Vec<f32>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.engine.is_none() {
            match self.provider.acquire() {
                Ok(handle) => self.engine = Some(handle),
                Err(err) => {
                    warn!(session = %self.session_id, "Engine acquisition failed: {}", err);
                    self.emit_error(ctx, "Transcription engine unavailable");
                    return;
                }
            }
        }

        let recognizer = match self.engine.as_ref().map(|handle| handle.recognizer()) {
            Some(Ok(recognizer)) => recognizer,
            _ => {
                self.emit_error(ctx, "Transcription engine unavailable");
                return;
            }
        };

        self.state = SessionState::Transcribing;
        self.turns += 1;
        debug!(session = %self.session_id, turn = self.turns, "Starting turn ({} samples)", samples.len());

        let sink = Arc::new(ActorSink {
            addr: ctx.address(),
        });
        tokio::spawn(run_turn(
            self.turns,
            samples,
            recognizer,
            self.history.clone(),
            self.services.clone(),
            sink,
        ));
    }

    /// Begin streaming transcription: acquire an engine handle and hand it to
    /// a dedicated blocking worker that owns the stream for its whole life.
    ///
    /// A `start_stream` while a stream is already active restarts it: the
    /// worker resets its accumulated state and `stream_started` is emitted
    /// again.
    fn start_stream(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match stream_start_action(self.state) {
            StreamStartAction::Reject => {
                self.emit_error(ctx, "Still processing the previous turn");
                return;
            }
            StreamStartAction::Restart => {
                if let Some(tx) = &self.stream_tx {
                    info!(session = %self.session_id, "Restarting active stream");
                    let _ = tx.send(StreamCmd::Reset);
                    return;
                }
                // No worker behind the active state; start fresh instead.
                self.state = SessionState::StreamIdle;
            }
            StreamStartAction::Fresh => {}
        }

        if self.provider.policy() == EnginePolicy::Shared {
            warn!(
                session = %self.session_id,
                "Streaming on a shared engine: partial decodes serialize across sessions"
            );
        }

        let handle = match self.provider.acquire() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session = %self.session_id, "Engine acquisition failed: {}", err);
                self.emit_error(ctx, "Transcription engine unavailable");
                return;
            }
        };

        let (tx, rx) = std::sync::mpsc::channel::<StreamCmd>();
        let addr = ctx.address();
        let session_id = self.session_id;

        tokio::task::spawn_blocking(move || {
            let mut stream = StreamingTranscript::new(handle);
            if let Err(err) = stream.start() {
                warn!(session = %session_id, "Stream start failed: {}", err);
                addr.do_send(Emit(ServerEvent::Error {
                    message: "Transcription engine unavailable".to_string(),
                }));
                // Pull the actor back out of streaming state; nothing will
                // consume the channel it holds.
                addr.do_send(StreamHalted);
                stream.release();
                return;
            }
            addr.do_send(Emit(ServerEvent::StreamStarted));

            loop {
                match rx.recv() {
                    Ok(StreamCmd::Feed(samples)) => match stream.feed(&samples) {
                        Ok(Some(text)) => {
                            addr.do_send(Emit(ServerEvent::PartialTranscript { text }))
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(session = %session_id, "Partial decode failed: {}", err)
                        }
                    },
                    Ok(StreamCmd::Reset) => match stream.start() {
                        Ok(()) => addr.do_send(Emit(ServerEvent::StreamStarted)),
                        Err(err) => {
                            warn!(session = %session_id, "Stream reset failed: {}", err)
                        }
                    },
                    // Explicit stop, or the connection went away.
                    Ok(StreamCmd::Stop) | Err(_) => break,
                }
            }

            match stream.stop() {
                Ok(text) => addr.do_send(Emit(ServerEvent::FinalTranscript { text })),
                Err(err) => {
                    warn!(session = %session_id, "Stream finalize failed: {}", err);
                    addr.do_send(Emit(ServerEvent::FinalTranscript {
                        text: String::new(),
                    }));
                }
            }
            stream.release();
        });

        self.stream_tx = Some(tx);
        self.state = SessionState::StreamActive;
        info!(session = %self.session_id, "Streaming transcription started");
    }

    /// Abandon the streaming worker channel and leave streaming mode.
    ///
    /// Called when the worker dies before any stop command (engine start
    /// failure), so later frames are not fed into a channel nothing reads.
    fn halt_stream(&mut self) {
        self.stream_tx = None;
        if self.state == SessionState::StreamActive {
            self.state = SessionState::StreamIdle;
        }
    }

    /// Stop streaming transcription. Safe to call with no stream active:
    /// the reply is then an empty final transcript.
    fn stop_stream(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.stream_tx.take() {
            Some(tx) => {
                // Worker emits the final transcript on its way out.
                let _ = tx.send(StreamCmd::Stop);
                self.state = SessionState::StreamIdle;
                info!(session = %self.session_id, "Streaming transcription stopped");
            }
            None => {
                self.emit(
                    ctx,
                    ServerEvent::FinalTranscript {
                        text: String::new(),
                    },
                );
            }
        }
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        match command {
            ClientCommand::Ping => self.emit(ctx, ServerEvent::Pong),
            ClientCommand::ClearHistory => {
                if let Ok(mut history) = self.history.lock() {
                    history.clear();
                }
                self.emit(ctx, ServerEvent::HistoryCleared);
                info!(session = %self.session_id, "Conversation history cleared");
            }
            ClientCommand::StartStream => self.start_stream(ctx),
            ClientCommand::StopStream => self.stop_stream(ctx),
        }
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.state {
            SessionState::StreamActive => {
                let samples = match decode_samples(data) {
                    Ok(samples) => samples,
                    Err(err) => {
                        debug!(session = %self.session_id, "Dropping bad stream chunk: {}", err);
                        return;
                    }
                };
                if let Some(tx) = &self.stream_tx {
                    let _ = tx.send(StreamCmd::Feed(samples));
                }
            }
            // Audio with no stream running carries no meaning; drop it.
            SessionState::StreamIdle => {
                debug!(session = %self.session_id, "Ignoring audio outside an active stream");
            }
            state if state.accepts_utterance() => {
                let samples = match decode_samples(data) {
                    Ok(samples) => samples,
                    Err(err) => {
                        self.emit_error(ctx, &err.to_string());
                        return;
                    }
                };
                if let Err(err) = validate_utterance(&samples) {
                    self.emit_error(ctx, &err.to_string());
                    return;
                }
                self.begin_turn(samples, ctx);
            }
            // One turn at a time: reject until the pipeline returns to Idle.
            _ => self.emit_error(ctx, "Still processing the previous turn"),
        }
    }
}

/// Forwards pipeline output from spawned tasks back into the actor.
struct ActorSink {
    addr: Addr<VoiceWebSocket>,
}

impl EventSink for ActorSink {
    fn event(&self, event: ServerEvent) {
        self.addr.do_send(Emit(event));
    }

    fn audio(&self, bytes: Vec<u8>) {
        self.addr.do_send(EmitAudio(bytes));
    }

    fn state(&self, state: SessionState) {
        self.addr.do_send(TurnStage(state));
    }
}

/// Deliver one JSON event to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Emit(ServerEvent);

/// Deliver one binary audio frame to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct EmitAudio(Vec<u8>);

/// Pipeline state transition reported by an in-flight turn.
#[derive(Message)]
#[rtype(result = "()")]
struct TurnStage(SessionState);

/// Streaming worker exited without being asked to stop.
#[derive(Message)]
#[rtype(result = "()")]
struct StreamHalted;

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session = %self.session_id, "Voice session connected");
        self.app_state.record_connection();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session = %act.session_id, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender stops the streaming worker; dropping the handle
        // releases a per-session engine instance.
        self.stream_tx = None;
        if let Some(mut handle) = self.engine.take() {
            handle.release();
        }
        self.app_state.record_disconnection();
        info!(session = %self.session_id, turns = self.turns, "Voice session closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                // None means malformed or unknown: defined to be ignored.
                if let Some(command) = ClientCommand::parse(&text) {
                    self.handle_command(command, ctx);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session = %self.session_id, "Client closed connection: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Emit> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Emit, ctx: &mut Self::Context) {
        if let Ok(json) = serde_json::to_string(&msg.0) {
            ctx.text(json);
        }
    }
}

impl Handler<EmitAudio> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: EmitAudio, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<TurnStage> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: TurnStage, _ctx: &mut Self::Context) {
        // Streaming state is managed by the actor itself; a late turn-stage
        // report must not clobber it.
        if matches!(self.state, SessionState::StreamIdle | SessionState::StreamActive) {
            return;
        }
        if msg.0 == SessionState::Idle && self.state != SessionState::Idle {
            self.app_state.record_turn();
        }
        debug!(session = %self.session_id, state = msg.0.as_str(), "Session state change");
        self.state = msg.0;
    }
}

impl Handler<StreamHalted> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: StreamHalted, _ctx: &mut Self::Context) {
        warn!(session = %self.session_id, "Streaming worker halted");
        self.halt_stream();
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request and hands the connection to a fresh
/// [`VoiceWebSocket`] actor. Refused with 503 when the configured session
/// limit is already reached.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let max_sessions = app_state.get_config().performance.max_concurrent_sessions;
    let active = app_state.get_metrics_snapshot().active_sessions as usize;
    if active >= max_sessions {
        warn!("Refusing connection: {} sessions active (limit {})", active, max_sessions);
        return Err(AppError::Capacity(format!(
            "Server is at its limit of {} concurrent sessions",
            max_sessions
        )));
    }

    info!(
        "New WebSocket connection from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(VoiceWebSocket::new(app_state), &req, stream)
        .map_err(|err| AppError::Internal(err.to_string()))
}
