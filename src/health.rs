use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-agent-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_connections": metrics.total_connections,
            "active_sessions": metrics.active_sessions,
            "turns_completed": metrics.turns_completed
        },
        "engine": {
            "policy": state.engine_provider().policy().as_str(),
            "model_path": config.models.recognizer_model_path
        },
        "models": {
            "completion": config.models.completion_model,
            "synthesis": config.models.synthesis_model,
            "voice": config.models.synthesis_voice
        }
    }))
}
