//! Decides, per request, whether to reuse a transport, create one, or
//! reject with a specific HTTP error.

use std::sync::Arc;

use axum::http::Method;
use serde_json::Value;
use tracing::info;

use crate::auth::Identity;
use crate::config::SessionMode;
use crate::engine::TransportEngine;
use crate::errors::AppError;
use crate::AppState;

/// Outcome of a successful resolution.
pub struct Resolution {
    pub transport: Arc<dyn TransportEngine>,
    /// Assigned or reused session id; `None` for stateless transports.
    pub session_id: Option<String>,
    /// Whether this request established a new session from the client's
    /// point of view.
    pub created: bool,
    /// Whether this request's own transport entered the registry. False for
    /// a lost creation race, where the winner's transport is reused.
    pub inserted: bool,
}

/// Resolves an inbound request to a transport. First matching rule of the
/// decision table wins:
///
/// - stateless DELETE        -> 405
/// - stateless otherwise     -> ephemeral transport, torn down by the caller
/// - stateful, id invalid    -> 404
/// - stateful, id valid      -> reuse bound transport, touch session
/// - stateful, no id, !POST  -> 400 session header required
/// - stateful, POST non-init -> 400 initialization required
/// - stateful, POST init     -> new session + transport
pub fn resolve_request(
    state: &AppState,
    method: &Method,
    session_header: Option<&str>,
    payload: Option<&Value>,
    identity: Option<&Identity>,
) -> Result<Resolution, AppError> {
    match state.session_mode {
        SessionMode::Stateless => resolve_stateless(state, method),
        SessionMode::Stateful => {
            resolve_stateful(state, method, session_header, payload, identity)
        }
    }
}

fn resolve_stateless(state: &AppState, method: &Method) -> Result<Resolution, AppError> {
    if method == Method::DELETE {
        return Err(AppError::SessionTerminationUnsupported);
    }

    // Ephemeral transport: never registered, caller closes it after use.
    let ephemeral_id = state.ids.next_id();
    let transport = state.factory.create(&ephemeral_id, state.registry.clone());
    Ok(Resolution {
        transport,
        session_id: None,
        created: true,
        inserted: false,
    })
}

fn resolve_stateful(
    state: &AppState,
    method: &Method,
    session_header: Option<&str>,
    payload: Option<&Value>,
    identity: Option<&Identity>,
) -> Result<Resolution, AppError> {
    if let Some(session_id) = session_header {
        // A valid record always has a bound transport (single registry
        // entry), so every invalid combination maps to the same 404.
        let transport = state
            .registry
            .resolve(session_id, identity)
            .ok_or(AppError::SessionNotFoundOrExpired)?;
        return Ok(Resolution {
            transport,
            session_id: Some(session_id.to_string()),
            created: false,
            inserted: false,
        });
    }

    if method != Method::POST {
        return Err(AppError::SessionHeaderRequired);
    }
    if !payload.is_some_and(is_initialization) {
        return Err(AppError::InitializationRequired);
    }

    let session_id = state.ids.next_id();
    let transport = state.factory.create(&session_id, state.registry.clone());
    let (transport, inserted) = state
        .registry
        .bind(&session_id, identity.cloned(), transport);
    if inserted {
        info!(session_id = %session_id, "session created");
    }
    // A lost creation race still counts as a creation from the client's
    // point of view; the winner's transport serves both requests.
    Ok(Resolution {
        transport,
        session_id: Some(session_id),
        created: true,
        inserted,
    })
}

/// A payload is an initialization if it is a handshake envelope or a batch
/// containing one.
pub fn is_initialization(payload: &Value) -> bool {
    match payload {
        Value::Array(batch) => batch.iter().any(is_handshake_envelope),
        envelope => is_handshake_envelope(envelope),
    }
}

fn is_handshake_envelope(envelope: &Value) -> bool {
    envelope.get("method").and_then(Value::as_str) == Some("initialize")
}
