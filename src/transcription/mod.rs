//! # Transcription Module
//!
//! Wraps the external speech-recognition capability behind a trait so the
//! orchestrator never sees model internals, and manages how warm engine
//! instances are shared between sessions.
//!
//! ## Key Components:
//! - **SpeechRecognizer**: the capability boundary (one-shot + incremental)
//! - **EngineProvider / EngineHandle**: shared-singleton vs per-session
//!   instance policy, chosen at startup and injected into every session
//! - **StreamingTranscript**: incremental transcription with partial-text
//!   change detection and idempotent stop
//! - **WhisperRecognizer**: optional whisper-rs backend (`whisper` feature)
//!
//! ## Sharing Policies:
//! A warm model is expensive to build, so the push-to-talk deployment
//! typically shares one engine across all connections (calls are strictly
//! serialized), while the streaming deployment gives each session its own
//! instance (released exactly once on teardown).

pub mod engine;
pub mod stream;
pub mod whisper;

pub use engine::{EngineHandle, EnginePolicy, EngineProvider, SpeechRecognizer};
pub use stream::StreamingTranscript;
