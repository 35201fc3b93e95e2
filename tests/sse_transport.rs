//! Integration tests for the SSE transport.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; event
//! streams are read frame by frame from the response body.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mcp_scaffold::config::ModuleParams;
use mcp_scaffold::error::ModuleError;
use mcp_scaffold::hello::HelloWorldModule;
use mcp_scaffold::mcp::module::{ChangeListener, ChangeListeners, ModuleCapability};
use mcp_scaffold::mcp::types::{ServerInfo, Tool};
use mcp_scaffold::mcp::{ProtocolServer, ToolContext};
use mcp_scaffold::transport::sse::{router, SseState};

// =============================================================================
// Harness
// =============================================================================

struct EventReader {
    body: Body,
    buf: String,
}

impl EventReader {
    /// Next `(event, data)` pair, or `None` once the stream ends.
    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let block: String = self.buf.drain(..end + 2).collect();
                let mut event = String::from("message");
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = v.trim_start().to_string();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push(v.trim_start().to_string());
                    }
                }
                if data.is_empty() {
                    // keep-alive comment
                    continue;
                }
                return Some((event, data.join("\n")));
            }

            let frame = tokio::time::timeout(Duration::from_secs(5), self.body.frame())
                .await
                .expect("timed out waiting for an event")?
                .unwrap();
            if let Ok(bytes) = frame.into_data() {
                self.buf.push_str(std::str::from_utf8(&bytes).unwrap());
            }
        }
    }

    async fn next_message(&mut self) -> Value {
        let (event, data) = self.next_event().await.expect("stream ended");
        assert_eq!(event, "message");
        serde_json::from_str(&data).unwrap()
    }
}

async fn connect(app: &Router) -> (EventReader, String) {
    let resp = app
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut reader = EventReader {
        body: resp.into_body(),
        buf: String::new(),
    };
    let (event, data) = reader.next_event().await.unwrap();
    assert_eq!(event, "endpoint");
    let session = data
        .strip_prefix("/messages/?session_id=")
        .expect("endpoint event names the message path")
        .to_string();
    (reader, session)
}

async fn post_raw(app: &Router, uri: &str, body: impl Into<Body>) -> StatusCode {
    app.clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn post(app: &Router, session: &str, message: &Value) -> StatusCode {
    post_raw(
        app,
        &format!("/messages/?session_id={session}"),
        message.to_string(),
    )
    .await
}

async fn initialise(app: &Router, reader: &mut EventReader, session: &str) {
    let status = post(
        app,
        session,
        &json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let resp = reader.next_message().await;
    assert_eq!(resp["id"], 0);
    assert!(resp.get("result").is_some());

    let status = post(
        app,
        session,
        &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

async fn hello_state(shutdown: CancellationToken) -> SseState {
    let mut module = HelloWorldModule::new();
    module.initialize(&ModuleParams::new()).await.unwrap();
    let server = ProtocolServer::new(ServerInfo::new("HelloWorldAPI", "0.1"), Arc::new(module));
    SseState::new(Arc::new(server), shutdown)
}

// =============================================================================
// Endpoint and POST handling
// =============================================================================

#[tokio::test]
async fn connect_announces_endpoint() {
    let state = hello_state(CancellationToken::new()).await;
    let app = router(state.clone());

    let (_reader, session) = connect(&app).await;
    assert!(!session.is_empty());
    assert_eq!(state.session_count(), 1);
}

#[tokio::test]
async fn post_status_codes() {
    let app = router(hello_state(CancellationToken::new()).await);
    let (_reader, session) = connect(&app).await;

    assert_eq!(
        post_raw(&app, "/messages/", "{}").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        post_raw(&app, "/messages/?session_id=nope", "{}").await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        post_raw(&app, &format!("/messages/?session_id={session}"), "not json").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        post(&app, &session, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await,
        StatusCode::ACCEPTED
    );
}

#[tokio::test]
async fn tool_call_over_sse() {
    let app = router(hello_state(CancellationToken::new()).await);
    let (mut reader, session) = connect(&app).await;
    initialise(&app, &mut reader, &session).await;

    post(
        &app,
        &session,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "hello", "arguments": {"name": "Ada"}}
        }),
    )
    .await;

    // notifications/message from ctx.info, then the result
    let log = reader.next_message().await;
    assert_eq!(log["method"], "notifications/message");
    let resp = reader.next_message().await;
    assert_eq!(resp["id"], 1);
    let payload: Value =
        serde_json::from_str(resp["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["message"], "Hello, Ada!");
}

#[tokio::test]
async fn sessions_are_isolated() {
    let app = router(hello_state(CancellationToken::new()).await);
    let (mut a, session_a) = connect(&app).await;
    let (mut b, session_b) = connect(&app).await;
    assert_ne!(session_a, session_b);

    initialise(&app, &mut a, &session_a).await;

    // B has not initialised, so its request is refused on B's stream only
    post(
        &app,
        &session_b,
        &json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}),
    )
    .await;
    let resp = b.next_message().await;
    assert_eq!(resp["id"], 5);
    assert_eq!(resp["error"]["code"], -32600);

    post(
        &app,
        &session_a,
        &json!({"jsonrpc": "2.0", "id": 6, "method": "tools/list"}),
    )
    .await;
    let resp = a.next_message().await;
    assert_eq!(resp["id"], 6);
    assert_eq!(resp["result"]["tools"][0]["name"], "hello");
}

// =============================================================================
// Catalog changes
// =============================================================================

#[derive(Default)]
struct Catalog {
    tools: Mutex<Vec<Tool>>,
    listeners: ChangeListeners,
}

#[async_trait]
impl ModuleCapability for Catalog {
    async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), ModuleError> {
        Ok(())
    }

    fn tools(&self) -> Vec<Tool> {
        let mut tools = vec![Tool::new(
            "add_tool",
            "Adds a tool to the catalog",
            json!({"type": "object", "properties": {"name": {"type": "string"}}}),
        )];
        tools.extend(self.tools.lock().unwrap().iter().cloned());
        tools
    }

    async fn call_tool(
        &self,
        _name: &str,
        arguments: &Map<String, Value>,
        _ctx: &ToolContext<'_>,
    ) -> Result<Value, ModuleError> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidArguments("name is required".to_string()))?;
        self.tools
            .lock()
            .unwrap()
            .push(Tool::new(name, "generated", json!({"type": "object"})));
        self.listeners.notify();
        Ok(json!({"added": name}))
    }

    fn subscribe_to_changes(&self, listener: ChangeListener) {
        self.listeners.add(listener);
    }
}

#[tokio::test]
async fn catalog_change_reaches_caller_and_other_sessions() {
    let server = ProtocolServer::new(ServerInfo::new("catalog", "1"), Arc::new(Catalog::default()));
    let app = router(SseState::new(Arc::new(server), CancellationToken::new()));

    let (mut a, session_a) = connect(&app).await;
    let (mut b, session_b) = connect(&app).await;
    initialise(&app, &mut a, &session_a).await;
    initialise(&app, &mut b, &session_b).await;

    post(
        &app,
        &session_a,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "add_tool", "arguments": {"name": "generated_tool"}}
        }),
    )
    .await;

    // The change notification is delivered asynchronously, so it may land
    // either side of the result.
    let first = a.next_message().await;
    let second = a.next_message().await;
    let both = [first, second];
    let methods: Vec<&str> = both
        .iter()
        .filter_map(|m| m["method"].as_str())
        .collect();
    assert_eq!(methods, ["notifications/resources/list_changed"]);
    assert!(both.iter().any(|m| m["id"] == 1));

    post(
        &app,
        &session_b,
        &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    let resp = b.next_message().await;
    assert_eq!(resp["id"], 2);
    let names: Vec<&str> = resp["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, ["add_tool", "generated_tool"]);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn shutdown_ends_streams_and_drains() {
    let shutdown = CancellationToken::new();
    let state = hello_state(shutdown.clone()).await;
    let app = router(state.clone());

    let (mut reader, session) = connect(&app).await;
    initialise(&app, &mut reader, &session).await;

    shutdown.cancel();
    assert!(reader.next_event().await.is_none());

    tokio::time::timeout(Duration::from_secs(5), state.drain())
        .await
        .expect("sessions did not drain");
    assert_eq!(state.session_count(), 0);
    assert_eq!(
        post(&app, &session, &json!({"jsonrpc": "2.0", "id": 9, "method": "ping"})).await,
        StatusCode::NOT_FOUND
    );
}
