//! # Whisper Speech Backend
//!
//! whisper-rs implementation of the [`SpeechRecognizer`] capability.
//!
//! ## Feature Gate
//!
//! Requires the `whisper` feature (and cmake at build time):
//!
//! ```bash
//! cargo build --features whisper
//! ```
//!
//! Without the feature a stub is compiled in; it constructs fine so the
//! server can start, but every transcription attempt reports that no speech
//! backend was built in.
//!
//! ## Incremental Mode
//!
//! Whisper has no native streaming API, so the incremental interface
//! accumulates samples and re-decodes the accumulated buffer once at least
//! 300ms of new audio arrived since the previous decode. Only the trailing
//! 30 seconds are decoded; whisper degrades beyond that window.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::audio::SAMPLE_RATE;
use crate::transcription::engine::SpeechRecognizer;

#[cfg(feature = "whisper")]
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// New audio required before the running transcript is re-decoded (300ms).
const REDECODE_SAMPLES: usize = (SAMPLE_RATE as usize) * 3 / 10;

/// Maximum trailing window decoded incrementally (30s).
const MAX_WINDOW_SAMPLES: usize = (SAMPLE_RATE as usize) * 30;

/// Configuration for the Whisper backend.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to the ggml model file
    pub model_path: PathBuf,
    /// Language code (e.g., "en")
    pub language: String,
    /// Inference threads (None = whisper default)
    pub threads: Option<usize>,
}

/// Whisper-backed recognizer.
#[cfg(feature = "whisper")]
pub struct WhisperRecognizer {
    context: WhisperContext,
    config: WhisperConfig,
    stream_buf: Vec<f32>,
    pending_samples: usize,
}

#[cfg(feature = "whisper")]
impl WhisperRecognizer {
    /// Load the model file and build a recognizer.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(anyhow!(
                "Whisper model not found at {}",
                config.model_path.display()
            ));
        }

        let path = config
            .model_path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid UTF-8 in model path"))?;
        let context = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| anyhow!("Failed to load Whisper model: {}", e))?;

        Ok(Self {
            context,
            config,
            stream_buf: Vec::new(),
            pending_samples: 0,
        })
    }

    /// Run one full decode over a sample buffer.
    fn decode(&self, samples: &[f32]) -> Result<String> {
        let mut state = self
            .context
            .create_state()
            .map_err(|e| anyhow!("Failed to create Whisper state: {}", e))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.config.language));
        if let Some(threads) = self.config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, samples)
            .map_err(|e| anyhow!("Whisper inference failed: {}", e))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            text.push_str(&segment.to_string());
        }

        Ok(text.trim().to_string())
    }

    /// The trailing decode window of the accumulated stream buffer.
    fn window(&self) -> &[f32] {
        let start = self.stream_buf.len().saturating_sub(MAX_WINDOW_SAMPLES);
        &self.stream_buf[start..]
    }
}

#[cfg(feature = "whisper")]
impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe_utterance(&mut self, samples: &[f32]) -> Result<String> {
        self.decode(samples)
    }

    fn start(&mut self) {
        self.stream_buf.clear();
        self.pending_samples = 0;
    }

    fn feed(&mut self, samples: &[f32]) {
        self.stream_buf.extend_from_slice(samples);
        self.pending_samples += samples.len();
    }

    fn poll_partial(&mut self) -> Result<Option<String>> {
        if self.pending_samples < REDECODE_SAMPLES || self.stream_buf.is_empty() {
            return Ok(None);
        }
        self.pending_samples = 0;
        self.decode(&self.window().to_vec()).map(Some)
    }

    fn finish(&mut self) -> Result<String> {
        let text = if self.stream_buf.is_empty() {
            String::new()
        } else {
            self.decode(&self.window().to_vec())?
        };
        self.stream_buf.clear();
        self.pending_samples = 0;
        Ok(text)
    }

    fn release(&mut self) {
        self.stream_buf = Vec::new();
    }
}

/// Stub recognizer compiled without the `whisper` feature.
///
/// The server starts, but transcription attempts fail with a hint about
/// rebuilding with the feature enabled.
#[cfg(not(feature = "whisper"))]
pub struct WhisperRecognizer {
    #[allow(dead_code)]
    config: WhisperConfig,
}

#[cfg(not(feature = "whisper"))]
impl WhisperRecognizer {
    pub fn new(config: WhisperConfig) -> Result<Self> {
        Ok(Self { config })
    }

    fn unavailable() -> anyhow::Error {
        anyhow!(
            "Whisper feature not enabled. This binary was built without speech recognition. \
             Rebuild with: cargo build --features whisper (requires cmake)"
        )
    }
}

#[cfg(not(feature = "whisper"))]
impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe_utterance(&mut self, _samples: &[f32]) -> Result<String> {
        Err(Self::unavailable())
    }

    fn start(&mut self) {}

    fn feed(&mut self, _samples: &[f32]) {}

    fn poll_partial(&mut self) -> Result<Option<String>> {
        Err(Self::unavailable())
    }

    fn finish(&mut self) -> Result<String> {
        Err(Self::unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_fields() {
        let config = WhisperConfig {
            model_path: PathBuf::from("models/ggml-base.en.bin"),
            language: "en".to_string(),
            threads: Some(4),
        };
        assert_eq!(config.language, "en");
        assert_eq!(config.threads, Some(4));
    }

    #[test]
    fn test_redecode_cadence_is_300ms() {
        assert_eq!(REDECODE_SAMPLES, 4800);
    }

    #[cfg(not(feature = "whisper"))]
    #[test]
    fn test_stub_reports_missing_backend() {
        let mut recognizer = WhisperRecognizer::new(WhisperConfig {
            model_path: PathBuf::from("models/ggml-base.en.bin"),
            language: "en".to_string(),
            threads: None,
        })
        .unwrap();

        let err = recognizer.transcribe_utterance(&[0.0; 16000]).unwrap_err();
        assert!(err.to_string().contains("whisper"));
    }

    #[cfg(feature = "whisper")]
    #[test]
    fn test_missing_model_file_rejected() {
        let result = WhisperRecognizer::new(WhisperConfig {
            model_path: PathBuf::from("/nonexistent/model.bin"),
            language: "en".to_string(),
            threads: None,
        });
        assert!(result.is_err());
    }
}
