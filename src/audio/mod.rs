//! # Audio Processing Module
//!
//! Decodes and validates the raw audio frames clients send over the
//! WebSocket before they reach the transcription engine.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Sample Width**: 32-bit IEEE floats
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian
//!
//! Turn-based utterances must carry at least 300ms of audio; streaming
//! chunks have no per-chunk minimum (the engine accumulates them).

pub mod frame;

pub use frame::{decode_samples, duration_seconds, FrameError, SAMPLE_RATE};
