//! # Pipeline Stages
//!
//! The three per-turn stages (Transcribe, Complete, Synthesize) each wrap
//! exactly one external collaborator call. This module holds what they have
//! in common: the timed outcome type, the timeout wrapper, and the degrade
//! policy applied when a stage fails.
//!
//! ## Failure Policy:
//! Stages never retry. A failed Complete stage substitutes a fixed apology
//! reply and the turn continues; a failed Synthesize stage simply produces
//! no audio. Neither failure is surfaced to the client as a raw error.

pub mod complete;
pub mod synthesize;

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::conversation::ChatTurn;

pub use complete::OpenAiCompletion;
pub use synthesize::OpenAiSynthesis;

/// Reply text substituted when the completion stage fails or times out.
pub const FALLBACK_REPLY: &str = "Sorry, I couldn't process that. Could you try again?";

/// Outcome of one pipeline stage.
///
/// Never dropped silently: every outcome either forwards a value to the
/// client or triggers the stage's degrade policy.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok { value: T, elapsed_ms: u64 },
    Failed { reason: String },
}

/// Run one collaborator call under a fixed timeout, measuring elapsed time.
///
/// A timeout resolves as `Failed` and gets the same degrade-and-continue
/// treatment as any other collaborator failure.
pub async fn run_stage<T, F>(timeout: Duration, call: F) -> StageOutcome<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => StageOutcome::Ok {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(err)) => StageOutcome::Failed {
            reason: err.to_string(),
        },
        Err(_) => StageOutcome::Failed {
            reason: format!("timed out after {}s", timeout.as_secs()),
        },
    }
}

/// The language-model completion collaborator.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Produce one reply for the given conversation window.
    async fn complete(&self, turns: &[ChatTurn]) -> anyhow::Result<String>;
}

/// The text-to-speech collaborator.
#[async_trait]
pub trait SpeechSynthesisService: Send + Sync {
    /// Synthesize speech audio for the given text.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;

    /// Encoding of the returned audio bytes, reported in the `tts_audio` header.
    fn format(&self) -> &str {
        "mp3"
    }
}

/// The collaborators one session needs to run a turn, plus the stage timeout.
pub struct AgentServices {
    pub completion: std::sync::Arc<dyn CompletionService>,
    pub synthesis: std::sync::Arc<dyn SpeechSynthesisService>,
    pub stage_timeout: Duration,
}
