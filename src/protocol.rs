//! # WebSocket Wire Protocol
//!
//! Defines the two message classes carried on the duplex connection:
//!
//! - **Binary frames**: raw audio samples (32-bit little-endian floats,
//!   16kHz, mono). Decoded by the `audio` module, not here.
//! - **Text frames**: one JSON object per frame, dispatched by a `type` tag.
//!
//! ## Protocol Rules:
//! - Malformed JSON and unrecognized message types are silently ignored:
//!   they cause no event and no state transition, and the connection stays open.
//! - A `tts_audio` header always immediately precedes the binary audio frame
//!   it describes; its `size` field equals that frame's exact byte length.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Control messages accepted from the client.
///
/// Modeled as a closed tagged enum over the recognized `type` values.
/// Anything outside this set is dropped by [`ClientCommand::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Heartbeat request; answered with `pong`
    Ping,

    /// Drop all conversation context (turn-based mode)
    ClearHistory,

    /// Begin incremental transcription (streaming mode)
    StartStream,

    /// Finalize incremental transcription and emit the final transcript
    StopStream,
}

impl ClientCommand {
    /// Parse a text frame into a command.
    ///
    /// Returns `None` for malformed JSON or unknown message types. Both are
    /// defined to be ignored rather than treated as fatal protocol errors.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(cmd) => Some(cmd),
            Err(err) => {
                debug!("Ignoring unrecognized control message: {}", err);
                None
            }
        }
    }
}

/// Events emitted to the client.
///
/// Field names and types match the wire contract exactly; see the module
/// docs for the `tts_audio` header/binary pairing rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Validation failure visible to the user (audio too short, no speech)
    Error { message: String },

    /// Transcript of the user's utterance, sent as soon as transcription
    /// completes so the client is not waiting on the later stages
    UserMessage {
        text: String,
        stt_ms: u64,
        audio_seconds: f64,
    },

    /// The agent's text reply (real or fallback), with stage timings
    AgentResponse {
        text: String,
        llm_ms: u64,
        total_ms: u64,
    },

    /// Header announcing the synthesized-audio binary frame that follows
    TtsAudio { format: String, size: usize },

    /// Heartbeat reply
    Pong,

    /// Acknowledgement that conversation context was dropped
    HistoryCleared,

    /// Acknowledgement that incremental transcription started
    StreamStarted,

    /// Updated running transcript (only sent when it changed)
    PartialTranscript { text: String },

    /// Final transcript, reply to `stop_stream`
    FinalTranscript { text: String },
}
