//! # Audio Frame Decoding
//!
//! Converts raw binary WebSocket frames into normalized sample buffers.
//! The wire format is fixed: 32-bit little-endian floats at 16kHz, mono,
//! so every frame's byte length must be a multiple of 4 and
//! `sample_count = byte_length / 4`.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Fixed sample rate for all audio on the wire.
pub const SAMPLE_RATE: u32 = 16_000;

/// Minimum utterance length accepted for turn-based transcription.
pub const MIN_UTTERANCE_SECS: f64 = 0.3;

/// Reasons a binary frame can be rejected before transcription.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Frame carried no payload
    Empty,

    /// Byte length was not a multiple of the 4-byte sample width
    Misaligned(usize),

    /// Utterance was shorter than the turn-based minimum
    TooShort { seconds: f64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => write!(f, "No audio data provided"),
            FrameError::Misaligned(len) => write!(
                f,
                "Audio frame length {} is not a multiple of 4 bytes (f32 samples)",
                len
            ),
            FrameError::TooShort { .. } => write!(f, "Audio too short (< 300ms)"),
        }
    }
}

/// Decode a binary frame into normalized f32 samples.
///
/// ## Parameters:
/// - **data**: Raw bytes from the WebSocket (32-bit float PCM, little-endian)
///
/// ## Returns:
/// The decoded sample buffer, or a [`FrameError`] if the frame is empty or
/// its length is not sample-aligned.
pub fn decode_samples(data: &[u8]) -> Result<Vec<f32>, FrameError> {
    if data.is_empty() {
        return Err(FrameError::Empty);
    }
    if data.len() % 4 != 0 {
        return Err(FrameError::Misaligned(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);

    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Duration of a sample buffer in seconds, rounded to two decimals.
///
/// The rounding matches what the client displays next to each transcript.
pub fn duration_seconds(sample_count: usize) -> f64 {
    let raw = sample_count as f64 / SAMPLE_RATE as f64;
    (raw * 100.0).round() / 100.0
}

/// Validate that an utterance is long enough for turn-based processing.
///
/// Below the 300ms minimum the session stays in `Idle` and the client gets
/// one `error` event; no transcription is attempted.
pub fn validate_utterance(samples: &[f32]) -> Result<(), FrameError> {
    let seconds = samples.len() as f64 / SAMPLE_RATE as f64;
    if seconds < MIN_UTTERANCE_SECS {
        return Err(FrameError::TooShort { seconds });
    }
    Ok(())
}
