//! # Voice Agent Backend - Main Entry Point
//!
//! Real-time voice interaction server: browser microphone audio in over a
//! WebSocket, transcribed speech through a language model, synthesized reply
//! audio back out. Sets up the Actix-web server with:
//!
//! - **config**: layered configuration (defaults, config.toml, APP_ env)
//! - **state**: shared state and server metrics
//! - **protocol / audio / conversation**: the wire contract and its data
//! - **transcription**: speech-recognition engine, sharing policy, streaming
//! - **pipeline**: completion and synthesis collaborators
//! - **session / websocket**: the per-connection turn orchestrator and actor
//! - **health / error**: the plain HTTP surface

mod audio;
mod config;
mod conversation;
mod error;
mod health;
mod pipeline;
mod protocol;
mod session;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use pipeline::{AgentServices, OpenAiCompletion, OpenAiSynthesis};
use state::AppState;
use transcription::engine::{warm_up, EnginePolicy, EngineProvider, SpeechRecognizer};
use transcription::whisper::{WhisperConfig, WhisperRecognizer};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-agent-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = build_services(&config)?;
    let engine = build_engine(&config)?;

    // First decode of a cold model is slow; take it at startup instead of on
    // the first user's turn.
    if let Err(err) = warm_up(&engine).await {
        warn!("Engine warm-up failed (continuing): {}", err);
    }

    let app_state = AppState::new(config.clone(), engine, services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .route("/ws", web::get().to(websocket::voice_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Build the completion and synthesis collaborators from config.
fn build_services(config: &AppConfig) -> Result<Arc<AgentServices>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY must be set for completion and synthesis")?;

    let stage_timeout = Duration::from_secs(config.agent.request_timeout_secs);
    let http = reqwest::Client::builder()
        .timeout(stage_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let completion = OpenAiCompletion::new(
        http.clone(),
        config.agent.completion_endpoint.clone(),
        api_key.clone(),
        config.models.completion_model.clone(),
        config.agent.system_prompt.clone(),
        config.agent.max_tokens,
        config.agent.temperature,
    );

    let synthesis = OpenAiSynthesis::new(
        http,
        config.agent.synthesis_endpoint.clone(),
        api_key,
        config.models.synthesis_model.clone(),
        config.models.synthesis_voice.clone(),
    );

    Ok(Arc::new(AgentServices {
        completion: Arc::new(completion),
        synthesis: Arc::new(synthesis),
        stage_timeout,
    }))
}

/// Build the engine provider for the configured sharing policy.
fn build_engine(config: &AppConfig) -> Result<EngineProvider> {
    let policy: EnginePolicy = config
        .performance
        .engine_policy
        .parse()
        .map_err(|err| anyhow!("{}", err))?;

    let whisper_config = WhisperConfig {
        model_path: PathBuf::from(&config.models.recognizer_model_path),
        language: "en".to_string(),
        threads: None,
    };

    if cfg!(not(feature = "whisper")) {
        warn!("Built without the whisper feature: transcription will report the missing backend");
    }

    match policy {
        EnginePolicy::Shared => {
            info!("Engine policy: shared (one warm instance, calls serialized in arrival order)");
            let recognizer = WhisperRecognizer::new(whisper_config)?;
            Ok(EngineProvider::shared(Box::new(recognizer)))
        }
        EnginePolicy::PerSession => {
            info!("Engine policy: per_session (fresh instance per connection)");
            Ok(EngineProvider::per_session(move || {
                Ok(Box::new(WhisperRecognizer::new(whisper_config.clone())?)
                    as Box<dyn SpeechRecognizer>)
            }))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_agent_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install SIGTERM/SIGINT handlers that flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
