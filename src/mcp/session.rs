//! One protocol session over one duplex message stream.
//!
//! A session owns the MCP handshake state for a single peer:
//!
//! 1. **Initialisation**: `initialize` negotiates the protocol version
//! 2. **Operation**: tool and prompt requests, served in arrival order
//! 3. **End**: the stream closes or the shutdown token fires
//!
//! Transports plug in through [`Inbound`] (where messages come from) and
//! [`Outbound`] (where replies and notifications go). The stdio transport
//! runs exactly one session; the SSE transport runs one per connection, all
//! sharing the same [`ProtocolServer`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ModuleError, SessionError};
use crate::mcp::context::RequestContext;
use crate::mcp::protocol::{
    negotiate_protocol_version, parse_message, ErrorCode, IncomingMessage, JsonRpcError, JsonRpcErrorData,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LogLevel, OutgoingNotification,
    ProgressToken, RequestId,
};
use crate::mcp::server::ProtocolServer;
use crate::mcp::types::{CallToolParams, GetPromptParams, InitializeParams};

/// Source of client-to-server messages.
#[async_trait]
pub trait Inbound: Send {
    /// Waits for the next raw message.
    ///
    /// Returns `None` once the peer has closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the stream fails.
    async fn next_message(&mut self) -> Result<Option<String>, SessionError>;
}

/// Sink for server-to-client messages.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Delivers one serialised JSON-RPC message.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is gone or the write fails.
    async fn send(&self, message: String) -> Result<(), SessionError>;

    /// Whether the peer is known to be gone.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Cloneable handle for pushing messages to one session's peer.
#[derive(Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    outbound: Arc<dyn Outbound>,
}

impl SessionHandle {
    /// Creates a handle.
    pub fn new(id: impl Into<Arc<str>>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    /// Session identifier used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the peer is known to be gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Serialises and sends any JSON-RPC message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or delivery fails.
    pub async fn send_json<T: Serialize + Sync>(&self, message: &T) -> Result<(), SessionError> {
        let json = serde_json::to_string(message)?;
        self.outbound.send(json).await
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    pub async fn send_notification(
        &self,
        notification: &OutgoingNotification,
    ) -> Result<(), SessionError> {
        self.send_json(notification).await
    }

    /// Sends `notifications/message`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    pub async fn send_log_message(
        &self,
        level: LogLevel,
        logger: &str,
        data: &str,
    ) -> Result<(), SessionError> {
        self.send_notification(&OutgoingNotification::log_message(level, logger, data))
            .await
    }

    /// Sends `notifications/progress`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    pub async fn send_progress(
        &self,
        token: &ProgressToken,
        progress: f64,
        total: Option<f64>,
    ) -> Result<(), SessionError> {
        self.send_notification(&OutgoingNotification::progress(token, progress, total))
            .await
    }

    /// Sends `notifications/resources/list_changed`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    pub async fn send_resource_list_changed(&self) -> Result<(), SessionError> {
        self.send_notification(&OutgoingNotification::resource_list_changed())
            .await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handshake state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize answered, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
}

/// Drives one peer's messages through the shared [`ProtocolServer`].
pub struct ProtocolSession {
    server: Arc<ProtocolServer>,
    handle: SessionHandle,
    state: SessionState,
    protocol_version: Option<&'static str>,
}

impl ProtocolSession {
    /// Creates a session in the `AwaitingInit` state.
    #[must_use]
    pub const fn new(server: Arc<ProtocolServer>, handle: SessionHandle) -> Self {
        Self {
            server,
            handle,
            state: SessionState::AwaitingInit,
            protocol_version: None,
        }
    }

    /// Current handshake state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated protocol version, once initialised.
    #[must_use]
    pub const fn protocol_version(&self) -> Option<&'static str> {
        self.protocol_version
    }

    /// Serves messages until the stream ends or `shutdown` fires.
    ///
    /// Shutdown is only observed between messages: a request that has already
    /// been read is answered before the loop exits.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the stream or writing a reply fails.
    pub async fn run<I>(
        mut self,
        inbound: &mut I,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        I: Inbound + ?Sized,
    {
        tracing::debug!(session = %self.handle.id(), "Session started");

        loop {
            let next = tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::debug!(session = %self.handle.id(), "Session stopping for shutdown");
                    return Ok(());
                }

                next = inbound.next_message() => next?,
            };

            let Some(message) = next else {
                tracing::debug!(session = %self.handle.id(), "Peer closed the stream");
                return Ok(());
            };

            if message.trim().is_empty() {
                continue;
            }

            self.handle_message(&message).await?;
        }
    }

    /// Handles one raw message and writes the reply, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be delivered.
    pub async fn handle_message(&mut self, raw: &str) -> Result<(), SessionError> {
        match parse_message(raw) {
            Ok(IncomingMessage::Request(req)) => {
                match self.handle_request(req).await {
                    Ok(resp) => self.handle.send_json(&resp).await,
                    Err(error) => self.handle.send_json(&error).await,
                }
            }
            Ok(IncomingMessage::Notification(notif)) => {
                self.handle_notification(&notif);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    session = %self.handle.id(),
                    code = error.error.code,
                    "Rejected malformed message"
                );
                self.handle.send_json(&error).await
            }
        }
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        tracing::debug!(session = %self.handle.id(), id = %req.id, method = %req.method, "Request");

        match req.method.as_str() {
            "initialize" => return self.handle_initialize(&req),
            "ping" => return Ok(JsonRpcResponse::success(req.id, json!({}))),
            _ => {}
        }

        self.require_initialised(&req.id)?;

        match req.method.as_str() {
            "tools/list" => Ok(JsonRpcResponse::success(
                req.id,
                json!({ "tools": self.server.list_tools() }),
            )),
            "tools/call" => self.handle_tools_call(req).await,
            "prompts/list" => Ok(JsonRpcResponse::success(
                req.id,
                json!({ "prompts": self.server.list_prompts() }),
            )),
            "prompts/get" => self.handle_prompts_get(req),
            "resources/list" => Ok(JsonRpcResponse::success(
                req.id,
                json!({ "resources": [] }),
            )),
            _ => Err(JsonRpcError::method_not_found(req.id, &req.method)),
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        if notif.method == "notifications/initialized" && self.state == SessionState::Initialising {
            self.state = SessionState::Running;
            tracing::info!(session = %self.handle.id(), "Session initialised");
        } else {
            tracing::debug!(session = %self.handle.id(), method = %notif.method, "Ignoring notification");
        }
    }

    fn handle_initialize(&mut self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        if self.state != SessionState::AwaitingInit {
            return Err(JsonRpcError::new(
                Some(req.id.clone()),
                JsonRpcErrorData::with_message(
                    ErrorCode::InvalidRequest,
                    "Session already initialised",
                ),
            ));
        }

        let params: InitializeParams = parse_params(req, "initialize")?;
        let version = negotiate_protocol_version(&params.protocol_version);
        let value = to_result_value(&req.id, &self.server.initialize_result(version))?;

        tracing::info!(
            session = %self.handle.id(),
            client = params.client_info.as_ref().map_or("unknown", |c| c.name.as_str()),
            requested = %params.protocol_version,
            negotiated = version,
            "Client connected"
        );

        self.protocol_version = Some(version);
        self.state = SessionState::Initialising;

        Ok(JsonRpcResponse::success(req.id.clone(), value))
    }

    async fn handle_tools_call(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        let params: CallToolParams = parse_params(&req, "tool call")?;
        let progress_token = params.meta.and_then(|m| m.progress_token);
        let ctx = RequestContext::new(req.id.clone(), progress_token, Some(self.handle.clone()));

        let result = self
            .server
            .call_tool(&params.name, params.arguments.as_ref(), &ctx)
            .await;

        let value = to_result_value(&req.id, &result)?;
        Ok(JsonRpcResponse::success(req.id, value))
    }

    fn handle_prompts_get(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        let params: GetPromptParams = parse_params(&req, "prompt")?;
        let arguments = params.arguments.unwrap_or_default();

        match self.server.get_prompt(&params.name, &arguments) {
            Ok(content) => {
                let value = to_result_value(&req.id, &content)?;
                Ok(JsonRpcResponse::success(req.id, value))
            }
            Err(e @ ModuleError::PromptNotFound(_)) => {
                Err(JsonRpcError::invalid_params(req.id, e.to_string()))
            }
            Err(e) => Err(JsonRpcError::internal_error(req.id, e.to_string())),
        }
    }

    fn require_initialised(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.state == SessionState::AwaitingInit {
            return Err(JsonRpcError::new(
                Some(id.clone()),
                JsonRpcErrorData::with_message(ErrorCode::InvalidRequest, "Session not initialised"),
            ));
        }
        Ok(())
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    req: &JsonRpcRequest,
    what: &str,
) -> Result<T, JsonRpcError> {
    let params = req.params.clone().ok_or_else(|| {
        JsonRpcError::invalid_params(req.id.clone(), format!("Missing {what} params"))
    })?;
    serde_json::from_value(params).map_err(|e| {
        JsonRpcError::invalid_params(req.id.clone(), format!("Invalid {what} params: {e}"))
    })
}

fn to_result_value<T: Serialize>(id: &RequestId, result: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialise result");
        JsonRpcError::internal_error(id.clone(), "Internal error: failed to serialise result")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::mcp::context::ToolContext;
    use crate::mcp::module::ModuleCapability;
    use crate::mcp::types::{ServerInfo, Tool};
    use crate::config::ModuleParams;
    use serde_json::Map;

    struct Echo;

    #[async_trait]
    impl ModuleCapability for Echo {
        async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), ModuleError> {
            Ok(())
        }

        fn tools(&self) -> Vec<Tool> {
            vec![Tool::new("echo", "Echoes its input", json!({"type": "object"}))]
        }

        async fn call_tool(
            &self,
            _name: &str,
            arguments: &Map<String, Value>,
            _ctx: &ToolContext<'_>,
        ) -> Result<Value, ModuleError> {
            Ok(Value::Object(arguments.clone()))
        }
    }

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Outbound for Capture {
        async fn send(&self, message: String) -> Result<(), SessionError> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_str(&message).unwrap());
            Ok(())
        }
    }

    struct Script(VecDeque<String>);

    #[async_trait]
    impl Inbound for Script {
        async fn next_message(&mut self) -> Result<Option<String>, SessionError> {
            Ok(self.0.pop_front())
        }
    }

    fn session() -> (ProtocolSession, Arc<Capture>) {
        let server = Arc::new(ProtocolServer::new(
            ServerInfo::new("test", "0.0.0"),
            Arc::new(Echo),
        ));
        let capture = Arc::new(Capture::default());
        let handle = SessionHandle::new("s1", capture.clone());
        (ProtocolSession::new(server, handle), capture)
    }

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t"}}}"#;
    const INITIALIZED: &str = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;

    #[tokio::test]
    async fn handshake_moves_through_states() {
        let (mut session, capture) = session();
        assert_eq!(session.state(), SessionState::AwaitingInit);

        session.handle_message(INIT).await.unwrap();
        assert_eq!(session.state(), SessionState::Initialising);
        assert_eq!(session.protocol_version(), Some("2024-11-05"));

        session.handle_message(INITIALIZED).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(sent[0]["result"]["serverInfo"]["name"], "test");
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let (mut session, capture) = session();
        session
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent[0]["error"]["code"], ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn ping_works_before_initialize() {
        let (mut session, capture) = session();
        session
            .handle_message(r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(capture.sent.lock().unwrap()[0]["result"], json!({}));
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (mut session, capture) = session();
        session.handle_message(INIT).await.unwrap();
        session.handle_message(INIT).await.unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent[1]["error"]["code"], ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let (mut session, capture) = session();
        session.handle_message(INIT).await.unwrap();
        session
            .handle_message(r#"{"jsonrpc":"2.0","id":3,"method":"sampling/create"}"#)
            .await
            .unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent[1]["error"]["code"], ErrorCode::MethodNotFound.code());
    }

    #[tokio::test]
    async fn run_serves_script_until_eof() {
        let (session, capture) = session();
        let mut inbound = Script(VecDeque::from(vec![
            INIT.to_string(),
            INITIALIZED.to_string(),
            String::new(),
            r#"{"jsonrpc":"2.0","id":4,"method":"resources/list"}"#.to_string(),
        ]));

        session
            .run(&mut inbound, &CancellationToken::new())
            .await
            .unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["result"]["resources"], json!([]));
    }

    #[tokio::test]
    async fn run_returns_immediately_when_cancelled() {
        let (session, capture) = session();
        let mut inbound = Script(VecDeque::from(vec![INIT.to_string()]));
        let token = CancellationToken::new();
        token.cancel();

        session.run(&mut inbound, &token).await.unwrap();
        assert!(capture.sent.lock().unwrap().is_empty());
    }
}
