//! Bearer-token middleware and the identity model bound to sessions.
//!
//! Token verification itself is behind the [`TokenVerifier`] trait so the
//! gateway only depends on a pass/fail answer plus the extracted claims.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{errors::AppError, AppState};

/// Authenticated-caller claims captured at session creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub tenant: Option<String>,
    pub client_id: Option<String>,
    pub subject: Option<String>,
}

impl Identity {
    /// Whether a session bound to `self` may be attached to by a caller
    /// presenting `presented`. Every populated field must match exactly;
    /// unpopulated fields do not constrain the caller.
    pub fn permits(&self, presented: Option<&Identity>) -> bool {
        let field_ok = |bound: &Option<String>, offered: Option<&String>| match bound {
            None => true,
            Some(value) => offered == Some(value),
        };

        field_ok(&self.tenant, presented.and_then(|i| i.tenant.as_ref()))
            && field_ok(&self.client_id, presented.and_then(|i| i.client_id.as_ref()))
            && field_ok(&self.subject, presented.and_then(|i| i.subject.as_ref()))
    }
}

#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies a bearer token, returning the caller's identity on success.
    async fn verify(&self, token: &str) -> Result<Identity, AppError>;
}

/// Single shared-secret verifier. Every holder of the token maps to the same
/// identity; real deployments substitute a JWT/OAuth implementation.
pub struct StaticTokenVerifier {
    token: Arc<str>,
    identity: Identity,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<Arc<str>>, identity: Identity) -> Self {
        Self {
            token: token.into(),
            identity,
        }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AppError> {
        if token == self.token.as_ref() {
            Ok(self.identity.clone())
        } else {
            Err(AppError::unauthorized("invalid bearer token"))
        }
    }
}

/// Populates the request with the verified caller identity. Inert when no
/// verifier is configured (auth-disabled mode).
pub async fn require_bearer_identity(
    State(state): State<AppState>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(verifier) = state.auth.as_ref() else {
        return Ok(next.run(request).await);
    };

    let Some(TypedHeader(bearer)) = auth_header else {
        return Err(AppError::unauthorized("missing authorization header"));
    };

    let identity = verifier.verify(bearer.token()).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
