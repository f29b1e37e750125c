//! Boundary to the protocol transport engine.
//!
//! The gateway never looks inside the engine: it hands over parsed JSON-RPC
//! payloads and receives either a response value or nothing (notifications).
//! Lifecycle events flow back through [`TransportEvents`], which the session
//! registry implements and passes to the factory at construction time.

use std::sync::Arc;

use axum::response::Response;
use serde_json::Value;

use crate::errors::AppError;

/// One live wire-level transport serving a single session.
#[async_trait::async_trait]
pub trait TransportEngine: Send + Sync {
    /// Handles a JSON-RPC request, notification, or batch. Returns `None`
    /// when there is nothing to send back (notification-only payloads).
    async fn handle_request(&self, payload: Value) -> Result<Option<Value>, AppError>;

    /// Opens the server-to-client event stream for this session.
    async fn open_event_stream(&self) -> Result<Response, AppError>;

    /// Closes the transport. Must signal [`TransportEvents::on_closed`]
    /// exactly once before returning.
    async fn close(&self);
}

/// Lifecycle callbacks the gateway hands to each engine instance. The engine
/// closure callback is the only writer to the registry besides the gateway
/// itself, and it must remove the mapping before returning.
pub trait TransportEvents: Send + Sync {
    fn on_closed(&self, session_id: &str);
    fn on_error(&self, session_id: &str, message: &str);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str, events: Arc<dyn TransportEvents>)
        -> Arc<dyn TransportEngine>;
}
