//! Origin allow-list guard against DNS-rebinding attacks.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{errors::AppError, AppState};

/// Rejects requests whose `Origin` header is not in the configured
/// allow-list. Inert when no allow-list is configured; requests without an
/// `Origin` header always pass (browsers omit it for non-CORS requests).
pub async fn enforce_allowed_origins(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(allowed) = state.allowed_origins.as_ref() else {
        return Ok(next.run(request).await);
    };

    let Some(value) = request.headers().get(header::ORIGIN) else {
        return Ok(next.run(request).await);
    };

    let origin = value.to_str().unwrap_or_default();
    if allowed.iter().any(|candidate| candidate.as_str() == origin) {
        return Ok(next.run(request).await);
    }

    warn!(
        origin = %origin,
        allowed = ?allowed,
        "rejecting request from disallowed origin"
    );
    Err(AppError::origin_rejected(origin))
}
