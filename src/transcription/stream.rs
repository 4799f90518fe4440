//! # Streaming Transcript Engine
//!
//! Drives a recognizer's incremental interface for one session and applies
//! change-detection so the client only hears about partial transcripts that
//! actually differ from the last one emitted.
//!
//! ## Lifecycle:
//! - `start()` clears accumulated state and begins a new stream
//! - `feed()` pushes a chunk and returns an updated partial, if any
//! - `stop()` finalizes and returns the full transcript; calling it without
//!   a preceding `start()` (or twice in a row) returns empty text
//! - `release()` frees a per-session engine instance exactly once
//!
//! All methods take the engine lock with `blocking_lock`, so this type must
//! only be driven from a blocking thread (the session's streaming worker),
//! never from an async task.

use anyhow::Result;

use crate::transcription::engine::EngineHandle;

/// Per-session incremental transcription state.
pub struct StreamingTranscript {
    handle: EngineHandle,
    active: bool,
    last_partial: String,
}

impl StreamingTranscript {
    pub fn new(handle: EngineHandle) -> Self {
        Self {
            handle,
            active: false,
            last_partial: String::new(),
        }
    }

    /// Begin a new stream, discarding any previous partial state.
    pub fn start(&mut self) -> Result<()> {
        let recognizer = self.handle.recognizer()?;
        recognizer.blocking_lock().start();
        self.active = true;
        self.last_partial.clear();
        Ok(())
    }

    /// Feed one audio chunk.
    ///
    /// Returns `Some(text)` only when the engine produced a running
    /// transcript that differs from the last partial we reported; identical
    /// re-decodes are suppressed so the connection is not flooded.
    pub fn feed(&mut self, samples: &[f32]) -> Result<Option<String>> {
        if !self.active {
            return Ok(None);
        }

        let recognizer = self.handle.recognizer()?;
        let mut guard = recognizer.blocking_lock();
        guard.feed(samples);

        if let Some(text) = guard.poll_partial()? {
            if !text.is_empty() && text != self.last_partial {
                self.last_partial = text.clone();
                return Ok(Some(text));
            }
        }

        Ok(None)
    }

    /// Finalize the stream and return the full transcript.
    ///
    /// Safe to call with no stream active: returns empty text. When the
    /// finalize pass itself yields nothing, the last emitted partial stands
    /// in as the final transcript.
    pub fn stop(&mut self) -> Result<String> {
        if !self.active {
            return Ok(String::new());
        }
        self.active = false;

        let recognizer = self.handle.recognizer()?;
        let final_text = recognizer.blocking_lock().finish()?;

        let text = if final_text.trim().is_empty() {
            std::mem::take(&mut self.last_partial)
        } else {
            self.last_partial.clear();
            final_text
        };

        Ok(text)
    }

    /// Release the underlying per-session engine instance (idempotent).
    pub fn release(&mut self) {
        self.handle.release();
    }
}
