//! # Engine Handle and Sharing Policy
//!
//! The speech-recognition engine is a stateful, expensive resource. This
//! module defines the capability trait the rest of the server programs
//! against, plus the two ways an engine instance can be owned:
//!
//! - **Shared**: one warm singleton serves every connection. All calls into
//!   it are mutually exclusive, at most one in-flight inference process-wide,
//!   and waiters run in arrival order (the tokio mutex keeps a FIFO wait
//!   queue).
//! - **PerSession**: each connection gets a private instance from a factory
//!   and must release it exactly once on teardown.
//!
//! Which policy is active is a deployment decision made at startup; session
//! code is identical either way because both hand out an [`EngineHandle`].

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audio::SAMPLE_RATE;

/// The external speech-recognition capability.
///
/// One-shot transcription serves the turn-based mode; the incremental
/// operations (`start`/`feed`/`poll_partial`/`finish`) serve streaming mode.
/// All methods may block for model inference, so callers must invoke them
/// from a blocking context, never on an async worker thread.
pub trait SpeechRecognizer: Send {
    /// Transcribe one complete utterance and return the plain text.
    fn transcribe_utterance(&mut self, samples: &[f32]) -> Result<String>;

    /// Reset incremental state and begin a new streaming transcription.
    fn start(&mut self);

    /// Append an audio chunk to the incremental accumulation.
    fn feed(&mut self, samples: &[f32]);

    /// Return the updated running transcript, if the engine re-decoded
    /// since the last poll. `None` means nothing new to report yet.
    fn poll_partial(&mut self) -> Result<Option<String>>;

    /// Finalize the incremental transcription and return the full text.
    fn finish(&mut self) -> Result<String>;

    /// Free any model or hardware resources held by this instance.
    fn release(&mut self) {}
}

/// A recognizer behind the process-wide exclusion lock.
pub type SharedRecognizer = Arc<Mutex<Box<dyn SpeechRecognizer>>>;

/// Builds a fresh recognizer for the per-session policy.
pub type RecognizerFactory = dyn Fn() -> Result<Box<dyn SpeechRecognizer>> + Send + Sync;

/// Engine-sharing policy, parsed from `performance.engine_policy` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePolicy {
    /// One warm singleton for the whole process (push-to-talk deployment)
    Shared,

    /// A private instance per connection (streaming deployment)
    PerSession,
}

impl EnginePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePolicy::Shared => "shared",
            EnginePolicy::PerSession => "per_session",
        }
    }
}

impl FromStr for EnginePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(EnginePolicy::Shared),
            "per_session" => Ok(EnginePolicy::PerSession),
            other => Err(format!(
                "Unknown engine policy '{}' (expected 'shared' or 'per_session')",
                other
            )),
        }
    }
}

/// Hands out engine handles to new sessions according to the active policy.
#[derive(Clone)]
pub enum EngineProvider {
    Shared(SharedRecognizer),
    PerSession(Arc<RecognizerFactory>),
}

impl EngineProvider {
    /// Wrap a single warm recognizer to be shared by every session.
    pub fn shared(recognizer: Box<dyn SpeechRecognizer>) -> Self {
        EngineProvider::Shared(Arc::new(Mutex::new(recognizer)))
    }

    /// Build a fresh recognizer for each session from the given factory.
    pub fn per_session<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn SpeechRecognizer>> + Send + Sync + 'static,
    {
        EngineProvider::PerSession(Arc::new(factory))
    }

    /// Acquire a handle for one session.
    ///
    /// Shared policy: clones the singleton reference (cheap). Per-session
    /// policy: constructs a new instance, which the caller must release on
    /// session teardown.
    pub fn acquire(&self) -> Result<EngineHandle> {
        match self {
            EngineProvider::Shared(shared) => Ok(EngineHandle {
                inner: Some(shared.clone()),
                owned: false,
            }),
            EngineProvider::PerSession(factory) => Ok(EngineHandle {
                inner: Some(Arc::new(Mutex::new(factory()?))),
                owned: true,
            }),
        }
    }

    pub fn policy(&self) -> EnginePolicy {
        match self {
            EngineProvider::Shared(_) => EnginePolicy::Shared,
            EngineProvider::PerSession(_) => EnginePolicy::PerSession,
        }
    }
}

/// One session's reference to a recognizer instance.
///
/// ## Release Discipline:
/// A per-session instance is released exactly once: `release()` takes the
/// inner reference out, so a second release is a no-op and any use after
/// release surfaces as an error instead of touching freed engine state.
/// Shared handles never release the singleton.
pub struct EngineHandle {
    inner: Option<SharedRecognizer>,
    owned: bool,
}

impl EngineHandle {
    /// The locked recognizer this handle points at.
    ///
    /// Callers lock it with `lock_owned().await` (turn pipeline, FIFO
    /// queueing) or `blocking_lock()` (streaming worker thread) and perform
    /// inference inside `spawn_blocking`.
    pub fn recognizer(&self) -> Result<SharedRecognizer> {
        self.inner
            .clone()
            .ok_or_else(|| anyhow!("Engine handle used after release"))
    }

    /// Release the engine instance (idempotent).
    ///
    /// An in-flight inference call is allowed to complete: if the lock is
    /// still held we skip the explicit release and let the final reference
    /// drop free the instance when the call returns.
    pub fn release(&mut self) {
        let Some(recognizer) = self.inner.take() else {
            return;
        };

        if self.owned {
            match recognizer.try_lock() {
                Ok(mut guard) => guard.release(),
                Err(_) => {
                    warn!("Engine still busy at release; deferring cleanup to final drop")
                }
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Warm up a shared engine by transcribing one second of silence.
///
/// Building the first decode is the slow part of a cold model; doing it at
/// startup keeps it off the first user's turn.
pub async fn warm_up(provider: &EngineProvider) -> Result<()> {
    let EngineProvider::Shared(shared) = provider else {
        return Ok(());
    };

    info!("Warming up shared transcription engine");
    let shared = shared.clone();
    let text = tokio::task::spawn_blocking(move || {
        let silence = vec![0.0f32; SAMPLE_RATE as usize];
        shared.blocking_lock().transcribe_utterance(&silence)
    })
    .await??;

    info!("Engine ready (warm-up transcript: '{}')", text);
    Ok(())
}
