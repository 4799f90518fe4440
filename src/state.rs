//! # Application State
//!
//! Shared state handed to every connection handler: the configuration, the
//! engine provider, the collaborator services, and the server metrics. All
//! mutable pieces sit behind `Arc<RwLock<T>>` so handlers on different
//! worker threads can read concurrently.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::AppConfig;
use crate::pipeline::AgentServices;
use crate::transcription::engine::EngineProvider;

/// State shared across all connections.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (readable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Server-wide counters, updated by every session
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Source of transcription engine handles for new sessions
    engine: EngineProvider,

    /// Completion and synthesis collaborators
    services: Arc<AgentServices>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters reported by the health endpoint.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// WebSocket connections accepted since startup
    pub total_connections: u64,

    /// Currently connected voice sessions
    pub active_sessions: u32,

    /// Turn pipelines run to completion (including degraded turns)
    pub turns_completed: u64,
}

impl AppState {
    pub fn new(config: AppConfig, engine: EngineProvider, services: Arc<AgentServices>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engine,
            services,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately; `AppConfig` is cheap to
    /// clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn engine_provider(&self) -> EngineProvider {
        self.engine.clone()
    }

    pub fn services(&self) -> Arc<AgentServices> {
        self.services.clone()
    }

    /// Called when a WebSocket session connects.
    pub fn record_connection(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.total_connections += 1;
        metrics.active_sessions += 1;
    }

    /// Called when a WebSocket session disconnects.
    pub fn record_disconnection(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Underflow guard: u32 panics on wrap.
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Called each time a turn pipeline returns to idle.
    pub fn record_turn(&self) {
        self.metrics.write().unwrap().turns_completed += 1;
    }

    /// Consistent copy of the metrics for serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompletionService, SpeechSynthesisService};
    use crate::transcription::engine::SpeechRecognizer;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullCompletion;

    #[async_trait]
    impl CompletionService for NullCompletion {
        async fn complete(
            &self,
            _turns: &[crate::conversation::ChatTurn],
        ) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct NullSynthesis;

    #[async_trait]
    impl SpeechSynthesisService for NullSynthesis {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0])
        }
    }

    struct NullRecognizer;

    impl SpeechRecognizer for NullRecognizer {
        fn transcribe_utterance(&mut self, _samples: &[f32]) -> anyhow::Result<String> {
            Ok(String::new())
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

    fn test_state() -> AppState {
        AppState::new(
            AppConfig::default(),
            EngineProvider::shared(Box::new(NullRecognizer)),
            Arc::new(AgentServices {
                completion: Arc::new(NullCompletion),
                synthesis: Arc::new(NullSynthesis),
                stage_timeout: Duration::from_secs(1),
            }),
        )
    }

    #[test]
    fn test_connection_counters() {
        let state = test_state();

        state.record_connection();
        state.record_connection();
        state.record_disconnection();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_sessions, 1);
    }

    #[test]
    fn test_disconnection_never_underflows() {
        let state = test_state();
        state.record_disconnection();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_turn_counter() {
        let state = test_state();
        state.record_turn();
        state.record_turn();
        assert_eq!(state.get_metrics_snapshot().turns_completed, 2);
    }
}
