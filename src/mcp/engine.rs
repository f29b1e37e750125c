//! Default transport engine: handshake, ping, and method routing.
//!
//! Domain methods (study search, lookup, aggregation) are served by richer
//! engines wired in through [`TransportFactory`]; this built-in engine keeps
//! the gateway exercisable on its own.

use std::convert::Infallible;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
};
use futures_util::stream;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ProtocolVersion, ServerCapabilities,
};
use serde_json::{json, Value};
use tracing::info;

use crate::engine::{TransportEngine, TransportEvents, TransportFactory};
use crate::errors::AppError;
use crate::mcp::rpc::{
    is_error, redact_params, response_error, response_error_with_data, response_result, Envelope,
};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct McpEngine {
    session_id: String,
    events: Arc<dyn TransportEvents>,
    closed: AtomicBool,
}

pub struct McpEngineFactory;

impl TransportFactory for McpEngineFactory {
    fn create(
        &self,
        session_id: &str,
        events: Arc<dyn TransportEvents>,
    ) -> Arc<dyn TransportEngine> {
        Arc::new(McpEngine {
            session_id: session_id.to_string(),
            events,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl TransportEngine for McpEngine {
    async fn handle_request(&self, payload: Value) -> Result<Option<Value>, AppError> {
        if self.closed.load(Ordering::SeqCst) {
            self.events
                .on_error(&self.session_id, "request received on closed transport");
            return Err(AppError::engine("transport is closed"));
        }

        match payload {
            Value::Array(batch) => {
                if batch.is_empty() {
                    return Ok(Some(Value::Array(vec![response_error(
                        None,
                        -32600,
                        "Invalid Request",
                    )])));
                }
                let mut responses = Vec::new();
                for item in batch {
                    if let Some(response) = self.handle_envelope(item) {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Value::Array(responses)))
                }
            }
            single => Ok(self.handle_envelope(single)),
        }
    }

    async fn open_event_stream(&self) -> Result<Response, AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::engine("transport is closed"));
        }

        let ready = stream::once(async {
            Ok::<_, Infallible>(Event::default().event("ready"))
        });
        Ok(Sse::new(ready)
            .keep_alive(KeepAlive::default())
            .into_response())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.on_closed(&self.session_id);
        }
    }
}

impl McpEngine {
    fn handle_envelope(&self, payload: Value) -> Option<Value> {
        if !payload.is_object() {
            return Some(response_error(None, -32600, "Invalid Request"));
        }

        let fallback_id = payload.get("id").cloned();
        let envelope: Envelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(_) => return Some(response_error(fallback_id, -32600, "Invalid Request")),
        };

        if envelope.jsonrpc != "2.0" || envelope.method.trim().is_empty() {
            return Some(response_error(envelope.id, -32600, "Invalid Request"));
        }

        let is_notification = envelope.id.is_none();
        let method = envelope.method.clone();
        let audit_params = redact_params(envelope.params.as_ref());
        let response = self.dispatch(envelope);

        info!(
            session_id = %self.session_id,
            method = %method,
            params = %audit_params,
            outcome = match &response {
                Some(value) if is_error(value) => "failure",
                _ => "success",
            },
            "protocol action audited"
        );

        if is_notification {
            None
        } else {
            response
        }
    }

    fn dispatch(&self, envelope: Envelope) -> Option<Value> {
        match envelope.method.as_str() {
            "initialize" => Some(self.handle_initialize(envelope.id, envelope.params.as_ref())),
            "ping" => Some(response_result(envelope.id, json!({}))),
            "notifications/initialized" => None,
            _ => {
                if envelope.id.is_some() {
                    Some(response_error(envelope.id, -32601, "Method not found"))
                } else {
                    None
                }
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: Option<&Value>) -> Value {
        let offered = params
            .and_then(Value::as_object)
            .and_then(|object| object.get("protocolVersion"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|version| !version.is_empty());

        let Some(offered) = offered else {
            return response_error_with_data(
                id,
                -32602,
                "Invalid params",
                Some(json!({
                    "code": "invalid_protocol_version",
                    "message": "initialize params.protocolVersion is required"
                })),
            );
        };

        if offered != SUPPORTED_PROTOCOL_VERSION {
            return response_error_with_data(
                id,
                -32602,
                "Invalid params",
                Some(json!({
                    "code": "unsupported_protocol_version",
                    "message": "unsupported initialize protocolVersion"
                })),
            );
        }

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities::default(),
            protocol_version: ProtocolVersion::V2024_11_05.into(),
            instructions: None,
            meta: None,
        };

        match serde_json::to_value(initialize_result) {
            Ok(result) => response_result(id, result),
            Err(_) => response_error(id, -32603, "Internal error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingEvents {
        closed: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }
    }

    impl TransportEvents for RecordingEvents {
        fn on_closed(&self, session_id: &str) {
            self.closed.lock().expect("lock").push(session_id.to_string());
        }

        fn on_error(&self, _session_id: &str, message: &str) {
            self.errors.lock().expect("lock").push(message.to_string());
        }
    }

    fn engine(events: Arc<RecordingEvents>) -> Arc<dyn TransportEngine> {
        McpEngineFactory.create("session-1", events)
    }

    fn initialize_payload() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": SUPPORTED_PROTOCOL_VERSION,
                "clientInfo": {"name": "test-client", "version": "1.0.0"},
                "capabilities": {}
            }
        })
    }

    #[tokio::test]
    async fn initialize_returns_server_info() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(initialize_payload())
            .await
            .expect("request handled")
            .expect("response present");

        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(
            response["result"]["protocolVersion"],
            SUPPORTED_PROTOCOL_VERSION
        );
        assert_eq!(
            response["result"]["serverInfo"]["name"],
            env!("CARGO_PKG_NAME")
        );
    }

    #[tokio::test]
    async fn initialize_rejects_unsupported_protocol_version() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "initialize",
                "params": {"protocolVersion": "1999-01-01"}
            }))
            .await
            .expect("request handled")
            .expect("response present");

        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(
            response["error"]["data"]["code"],
            "unsupported_protocol_version"
        );
    }

    #[tokio::test]
    async fn ping_returns_empty_result() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}))
            .await
            .expect("request handled")
            .expect("response present");

        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 8, "method": "studies/search"}))
            .await
            .expect("request handled")
            .expect("response present");

        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .expect("request handled");
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn batch_returns_only_id_responses() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!([
                {"jsonrpc": "2.0", "method": "ping"},
                {"jsonrpc": "2.0", "id": 100, "method": "ping"},
                {"jsonrpc": "2.0", "id": 200, "method": "nope"}
            ]))
            .await
            .expect("request handled")
            .expect("response present");

        let responses = response.as_array().expect("batch response array");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 100);
        assert_eq!(responses[1]["id"], 200);
    }

    #[tokio::test]
    async fn batch_of_notifications_returns_none() {
        let engine = engine(RecordingEvents::new());
        let response = engine
            .handle_request(json!([
                {"jsonrpc": "2.0", "method": "ping"},
                {"jsonrpc": "2.0", "method": "notifications/initialized"}
            ]))
            .await
            .expect("request handled");
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn audit_log_records_session_and_method() {
        struct BufferWriter(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for BufferWriter {
            fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("lock").extend_from_slice(bytes);
                Ok(bytes.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || BufferWriter(sink.clone()))
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let engine = engine(RecordingEvents::new());
        engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}))
            .await
            .expect("request handled");

        let output = String::from_utf8(buffer.lock().expect("lock").clone()).expect("utf8 log");
        assert!(output.contains("protocol action audited"));
        assert!(output.contains("session_id=session-1"));
        assert!(output.contains("method=ping"));
    }

    #[tokio::test]
    async fn close_signals_events_exactly_once() {
        let events = RecordingEvents::new();
        let engine = engine(events.clone());

        engine.close().await;
        engine.close().await;

        assert_eq!(
            events.closed.lock().expect("lock").as_slice(),
            ["session-1"]
        );
    }

    #[tokio::test]
    async fn closed_engine_rejects_requests() {
        let events = RecordingEvents::new();
        let engine = engine(events.clone());
        engine.close().await;

        let err = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .expect_err("closed transport must reject");
        assert!(matches!(err, AppError::Engine { .. }));
        assert_eq!(events.errors.lock().expect("lock").len(), 1);
    }
}
