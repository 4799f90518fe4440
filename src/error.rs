//! # Error Handling
//!
//! Application error taxonomy and its HTTP mapping. Most failures in this
//! server never reach HTTP (collaborator failures degrade inside the turn
//! pipeline and validation failures become WebSocket error events), so this
//! type mainly covers the connection handshake and the plain HTTP endpoints.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Client input failed validation
    Validation(String),

    /// An external collaborator (completion, synthesis, engine) failed
    Collaborator(String),

    /// Client violated the wire protocol
    Protocol(String),

    /// Server is at its concurrent-session limit
    Capacity(String),

    /// Configuration file or environment problems
    Config(String),

    /// Everything else server-side
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Collaborator(msg) => write!(f, "Collaborator error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::Capacity(msg) => write!(f, "Capacity error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Validation(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Protocol(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "protocol_error",
                msg.clone(),
            ),
            AppError::Capacity(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "capacity_error",
                msg.clone(),
            ),
            AppError::Collaborator(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "collaborator_error",
                msg.clone(),
            ),
            AppError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
