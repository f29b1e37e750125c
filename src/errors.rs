use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("origin not allowed: {origin}")]
    OriginRejected { origin: String },
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
    #[error("session not found or expired")]
    SessionNotFoundOrExpired,
    #[error("session id header required")]
    SessionHeaderRequired,
    #[error("initialization request required")]
    InitializationRequired,
    #[error("session termination not supported in stateless mode")]
    SessionTerminationUnsupported,
    #[error("unauthorized: {message}")]
    Unauthorized { message: &'static str },
    #[error("engine error: {message}")]
    Engine { message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl AppError {
    pub fn origin_rejected(origin: impl Into<String>) -> Self {
        Self::OriginRejected {
            origin: origin.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self::Unauthorized { message }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::OriginRejected { .. } => (
                StatusCode::FORBIDDEN,
                "origin_rejected",
                "Origin not allowed".to_string(),
            ),
            Self::MalformedPayload { message } => (
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                format!("Malformed payload: {message}"),
            ),
            Self::SessionNotFoundOrExpired => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                "Session not found or expired".to_string(),
            ),
            Self::SessionHeaderRequired => (
                StatusCode::BAD_REQUEST,
                "session_header_required",
                "Mcp-Session-Id header required".to_string(),
            ),
            Self::InitializationRequired => (
                StatusCode::BAD_REQUEST,
                "initialization_required",
                "Initialization request required to start a new session".to_string(),
            ),
            Self::SessionTerminationUnsupported => (
                StatusCode::METHOD_NOT_ALLOWED,
                "termination_unsupported",
                "Session termination is not supported in stateless mode".to_string(),
            ),
            Self::Unauthorized { message } => {
                (StatusCode::UNAUTHORIZED, "unauthorized", message.to_string())
            }
            Self::Engine { message } => {
                tracing::error!(error = %message, "request failed with engine error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "engine_error",
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}
