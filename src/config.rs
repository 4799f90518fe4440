//! # Configuration Management
//!
//! Loads application configuration from three sources, later ones winning:
//!
//! 1. Built-in defaults (the `Default` impl below)
//! 2. A `config.toml` file in the working directory, if present
//! 3. Environment variables with the `APP_` prefix
//!    (`APP_SERVER_PORT=9000` sets `server.port`)
//!
//! `HOST` and `PORT` without the prefix are honored too, for deployment
//! platforms that inject them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default system prompt steering the agent toward short spoken replies.
const DEFAULT_SYSTEM_PROMPT: &str = "You are VoiceAgent, a helpful AI assistant optimized for voice conversation.
Keep responses concise and conversational — they'll be spoken aloud via text-to-speech.
Aim for 1-3 sentences unless the user asks for detail.
Be warm, direct, and natural. Avoid markdown formatting, bullet points, or code blocks.
If you need to give a list, say it naturally: \"first... second... and third...\"
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub models: ModelsConfig,
    pub agent: AgentConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Input audio contract: clients send f32 little-endian PCM at this rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub min_utterance_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Path to the on-disk speech-recognition model
    pub recognizer_model_path: String,
    /// Chat-completions model identifier
    pub completion_model: String,
    /// Speech-synthesis model identifier
    pub synthesis_model: String,
    /// Speech-synthesis voice name
    pub synthesis_voice: String,
}

/// Conversation behavior and collaborator endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-stage timeout for completion and synthesis calls
    pub request_timeout_secs: u64,
    /// Bound on the conversation window (messages, not exchanges)
    pub history_turns: usize,
    pub completion_endpoint: String,
    pub synthesis_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// `shared` (one warm engine, FIFO across sessions) or `per_session`
    pub engine_policy: String,
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                min_utterance_ms: 300,
            },
            models: ModelsConfig {
                recognizer_model_path: "models/ggml-base.en.bin".to_string(),
                completion_model: "gpt-4o-mini".to_string(),
                synthesis_model: "tts-1".to_string(),
                synthesis_voice: "onyx".to_string(),
            },
            agent: AgentConfig {
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                max_tokens: 300,
                temperature: 0.7,
                request_timeout_secs: 15,
                history_turns: 20,
                completion_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                synthesis_endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
            },
            performance: PerformanceConfig {
                engine_policy: "shared".to_string(),
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, file, and environment, in that order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject bare HOST/PORT.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot work before the server starts.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate != 16_000 {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate {} (transcription models expect 16000)",
                self.audio.sample_rate
            ));
        }

        if self.agent.history_turns == 0 {
            return Err(anyhow::anyhow!("History window must hold at least one message"));
        }

        if self.agent.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Collaborator timeout must be greater than 0"));
        }

        self.performance
            .engine_policy
            .parse::<crate::transcription::engine::EnginePolicy>()
            .map_err(|err| anyhow::anyhow!(err))?;

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_agent_tuning() {
        let config = AppConfig::default();
        assert_eq!(config.agent.max_tokens, 300);
        assert!((config.agent.temperature - 0.7).abs() < 1e-6);
        assert_eq!(config.agent.request_timeout_secs, 15);
        assert_eq!(config.agent.history_turns, 20);
        assert!(config.agent.system_prompt.contains("VoiceAgent"));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_sample_rate_rejected() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 44_100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_engine_policy_rejected() {
        let mut config = AppConfig::default();
        config.performance.engine_policy = "gpu_cluster".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.models.completion_model, "gpt-4o-mini");
        assert_eq!(parsed.performance.engine_policy, "shared");
    }
}
