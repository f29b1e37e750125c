//! Axum HTTP handlers: health, OAuth resource metadata, and the protocol
//! endpoint driving session resolution.

use std::any::Any;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::auth::Identity;
use crate::config::SessionMode;
use crate::errors::{AppError, ErrorResponse};
use crate::mcp::engine::SUPPORTED_PROTOCOL_VERSION;
use crate::mcp::rpc::is_error;
use crate::session::resolve::{resolve_request, Resolution};
use crate::AppState;

// Header names are case-insensitive; the http crate stores them lowercase.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ServerInfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub environment: String,
    pub transport: &'static str,
    pub session_mode: String,
}

/// Document served at `/.well-known/oauth-protected-resource` when an
/// authorization issuer is configured.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
    pub resource_signing_alg_values_supported: Vec<String>,
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn oauth_protected_resource(State(state): State<AppState>) -> Response {
    let Some(metadata) = state.resource_metadata.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    (
        [(header::CACHE_CONTROL, "max-age=3600")],
        Json(metadata.as_ref().clone()),
    )
        .into_response()
}

pub async fn protocol_get(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    headers: HeaderMap,
) -> Response {
    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    if !wants_stream {
        return Json(ServerInfoResponse {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            environment: state.environment.to_string(),
            transport: "streamable-http",
            session_mode: state.session_mode.to_string(),
        })
        .into_response();
    }

    let resolution = match resolve_request(
        &state,
        &Method::GET,
        session_header(&headers),
        None,
        identity.as_ref().map(|ext| &ext.0),
    ) {
        Ok(resolution) => resolution,
        Err(err) => return err.into_response(),
    };

    let response = match resolution.transport.open_event_stream().await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    if state.session_mode == SessionMode::Stateless {
        resolution.transport.close().await;
    }
    response
}

pub async fn protocol_post(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return AppError::malformed("request body is not valid JSON").into_response(),
    };

    let resolution = match resolve_request(
        &state,
        &Method::POST,
        session_header(&headers),
        Some(&payload),
        identity.as_ref().map(|ext| &ext.0),
    ) {
        Ok(resolution) => resolution,
        Err(err) => return err.into_response(),
    };

    let response = match resolution.transport.handle_request(payload).await {
        Ok(outcome) => {
            // A session only survives a successful handshake; an error reply
            // to the initialization request rolls the registration back.
            // Gated on `inserted` so a lost creation race cannot tear down
            // the winner's live session.
            let handshake_failed = resolution.inserted
                && outcome.as_ref().map_or(false, |value| is_error(value));
            if handshake_failed {
                rollback_creation(&state, &resolution).await;
                match outcome {
                    Some(value) => (StatusCode::OK, Json(value)).into_response(),
                    None => StatusCode::NO_CONTENT.into_response(),
                }
            } else {
                success_response(&resolution, outcome)
            }
        }
        Err(err) => {
            if resolution.inserted {
                rollback_creation(&state, &resolution).await;
            }
            err.into_response()
        }
    };

    // Stateless transports never outlive the request.
    if state.session_mode == SessionMode::Stateless {
        resolution.transport.close().await;
    }
    response
}

async fn rollback_creation(state: &AppState, resolution: &Resolution) {
    if let Some(session_id) = resolution.session_id.as_deref() {
        state.registry.terminate(session_id).await;
    }
}

pub async fn protocol_delete(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    headers: HeaderMap,
) -> Response {
    let resolution = match resolve_request(
        &state,
        &Method::DELETE,
        session_header(&headers),
        None,
        identity.as_ref().map(|ext| &ext.0),
    ) {
        Ok(resolution) => resolution,
        Err(err) => return err.into_response(),
    };

    if let Some(session_id) = resolution.session_id.as_deref() {
        state.registry.terminate(session_id).await;
        info!(session_id, "session terminated by client");
    }
    StatusCode::NO_CONTENT.into_response()
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn success_response(resolution: &Resolution, outcome: Option<Value>) -> Response {
    let mut response = match outcome {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    };

    if resolution.created {
        if let Some(session_id) = resolution.session_id.as_deref() {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
                response.headers_mut().insert(
                    MCP_PROTOCOL_VERSION_HEADER,
                    HeaderValue::from_static(SUPPORTED_PROTOCOL_VERSION),
                );
            }
        }
    }
    response
}

/// Outermost request boundary: panics become a 500 with an opaque body.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> HttpResponse<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(error = %detail, "request handler panicked");

    let body = serde_json::to_string(&ErrorResponse {
        error: "internal_error".to_string(),
        message: "internal server error".to_string(),
    })
    .unwrap_or_else(|_| r#"{"error":"internal_error"}"#.to_string());

    let mut response = HttpResponse::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
