use std::sync::Arc;

use axum::{
    middleware,
    routing::get,
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;

pub mod auth;
pub mod config;
pub mod engine;
pub mod errors;
pub mod http;
pub mod launch;
pub mod logging;
pub mod mcp;
pub mod origin;
pub mod session;

use auth::{Identity, StaticTokenVerifier, TokenVerifier};
use config::{Config, SessionMode};
use engine::TransportFactory;
use http::handlers::ResourceMetadata;
use mcp::engine::McpEngineFactory;
use session::registry::{Clock, SessionRegistry, SystemClock};
use session::{SessionIdSource, UuidSource};

#[derive(Clone)]
pub struct AppState {
    pub session_mode: SessionMode,
    pub endpoint_path: Arc<str>,
    pub environment: Arc<str>,
    pub allowed_origins: Option<Arc<[String]>>,
    pub auth: Option<Arc<dyn TokenVerifier>>,
    pub resource_metadata: Option<Arc<ResourceMetadata>>,
    pub registry: Arc<SessionRegistry>,
    pub factory: Arc<dyn TransportFactory>,
    pub ids: Arc<dyn SessionIdSource>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            config,
            Arc::new(McpEngineFactory),
            Arc::new(UuidSource),
            Arc::new(SystemClock),
        )
    }

    /// Explicit wiring so tests can substitute deterministic id sources,
    /// clocks, or engine factories per case.
    pub fn with_parts(
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        ids: Arc<dyn SessionIdSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth = config.api_token.as_ref().map(|token| {
            Arc::new(StaticTokenVerifier::new(token.clone(), Identity::default()))
                as Arc<dyn TokenVerifier>
        });

        let resource_metadata = config.auth_issuer.as_ref().map(|issuer| {
            Arc::new(ResourceMetadata {
                resource: config.auth_resource.clone().unwrap_or_else(|| {
                    format!(
                        "http://{}:{}{}",
                        config.bind_addr, config.bind_port, config.endpoint_path
                    )
                }),
                authorization_servers: vec![issuer.clone()],
                bearer_methods_supported: vec!["header".to_string()],
                resource_signing_alg_values_supported: vec![
                    "RS256".to_string(),
                    "ES256".to_string(),
                ],
            })
        });

        Self {
            session_mode: config.session_mode,
            endpoint_path: Arc::from(config.endpoint_path.as_str()),
            environment: Arc::from(config.environment.as_str()),
            allowed_origins: config
                .allowed_origins
                .as_ref()
                .map(|origins| Arc::from(origins.clone())),
            auth,
            resource_metadata,
            registry: Arc::new(SessionRegistry::new(config.stale_timeout_ms, clock)),
            factory,
            ids,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let endpoint = state.endpoint_path.to_string();
    let protocol = Router::new()
        .route(
            &endpoint,
            get(http::handlers::protocol_get)
                .post(http::handlers::protocol_post)
                .delete(http::handlers::protocol_delete),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_identity,
        ));

    Router::new()
        .route("/healthz", get(http::handlers::healthz))
        .route(
            "/.well-known/oauth-protected-resource",
            get(http::handlers::oauth_protected_resource),
        )
        .merge(protocol)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            origin::enforce_allowed_origins,
        ))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .layer(CatchPanicLayer::custom(http::handlers::handle_panic))
        .with_state(state)
}
