//! HTTP + server-sent events transport.
//!
//! - `GET /` opens an event stream and starts a new protocol session. The
//!   first event is `endpoint`, telling the client where to post messages;
//!   every later `message` event carries one server-to-client JSON-RPC
//!   message.
//! - `POST /messages/?session_id=<id>` queues one client-to-server message
//!   into that session and answers `202 Accepted`.
//!
//! Each connection runs its own [`ProtocolSession`] against the shared
//! [`ProtocolServer`]; a failing connection only ends its own session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::{ServerError, SessionError};
use crate::mcp::server::ProtocolServer;
use crate::mcp::session::{Inbound, Outbound, ProtocolSession, SessionHandle};

/// Path clients post messages to.
pub const MESSAGES_PATH: &str = "/messages/";

/// Interval between keep-alive comments on idle streams.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Buffered messages per direction per session.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Shared state behind the SSE router.
#[derive(Clone)]
pub struct SseState {
    inner: Arc<SseInner>,
}

struct SseInner {
    server: Arc<ProtocolServer>,
    sessions: Mutex<HashMap<String, mpsc::Sender<String>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SseState {
    /// Creates state for a server; `shutdown` ends every stream and session.
    #[must_use]
    pub fn new(server: Arc<ProtocolServer>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SseInner {
                server,
                sessions: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Drops every session's inbound channel and waits for the session
    /// tasks to finish.
    pub async fn drain(&self) {
        let open = {
            let mut sessions = self.sessions();
            let open = sessions.len();
            sessions.clear();
            open
        };
        tracing::debug!(open, "Draining SSE sessions");
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<String>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        self.sessions().insert(id.clone(), tx);
        tracing::debug!(session = %id, "Created SSE session");
        (id, rx)
    }

    fn remove(&self, id: &str) {
        if self.sessions().remove(id).is_some() {
            tracing::debug!(session = %id, "Removed SSE session");
        }
    }

    fn sender(&self, id: &str) -> Option<mpsc::Sender<String>> {
        self.sessions().get(id).cloned()
    }
}

impl std::fmt::Debug for SseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseState")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

/// Messages posted by the client, in arrival order.
struct ChannelInbound {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl Inbound for ChannelInbound {
    async fn next_message(&mut self) -> Result<Option<String>, SessionError> {
        Ok(self.rx.recv().await)
    }
}

/// Messages for the client's event stream.
struct ChannelOutbound {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl Outbound for ChannelOutbound {
    async fn send(&self, message: String) -> Result<(), SessionError> {
        self.tx.send(message).await.map_err(|_| SessionError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Builds the router. CORS is fully permissive.
pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/", get(handle_connect))
        .route(MESSAGES_PATH, post(handle_post))
        .route("/messages", post(handle_post))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn handle_connect(State(state): State<SseState>) -> impl IntoResponse {
    let (id, inbound_rx) = state.register();
    let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

    let handle = SessionHandle::new(id.as_str(), Arc::new(ChannelOutbound { tx: outbound_tx }));
    let session = ProtocolSession::new(Arc::clone(&state.inner.server), handle);
    let shutdown = state.inner.shutdown.clone();
    let session_id = id.clone();
    state.inner.tracker.spawn(async move {
        let mut inbound = ChannelInbound { rx: inbound_rx };
        match session.run(&mut inbound, &shutdown).await {
            Ok(()) => tracing::debug!(session = %session_id, "SSE session ended"),
            Err(e) => tracing::warn!(session = %session_id, error = %e, "SSE session failed"),
        }
    });

    tracing::info!(session = %id, "SSE client connected");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGES_PATH}?session_id={id}"));
    let events = stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(
        ReceiverStream::new(outbound_rx)
            .map(|message| Ok(Event::default().event("message").data(message))),
    );
    let events = events.take_until(state.inner.shutdown.clone().cancelled_owned());

    let stream = SessionStream {
        inner: Box::pin(events),
        state,
        id,
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// Event stream that removes its session from the registry when the client
/// goes away.
struct SessionStream<S> {
    inner: Pin<Box<S>>,
    state: SseState,
    id: String,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for SessionStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for SessionStream<S> {
    fn drop(&mut self) {
        tracing::info!(session = %self.id, "SSE client disconnected");
        self.state.remove(&self.id);
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn handle_post(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "session_id is required");
    };
    let Some(tx) = state.sender(&id) else {
        tracing::warn!(session = %id, "Message for unknown session");
        return (StatusCode::NOT_FOUND, "Could not find session");
    };
    let message = match String::from_utf8(body.to_vec()) {
        Ok(text) if serde_json::from_str::<serde_json::Value>(&text).is_ok() => text,
        _ => {
            tracing::warn!(session = %id, "Rejected message body that is not JSON");
            return (StatusCode::BAD_REQUEST, "Could not parse message");
        }
    };

    if tx.send(message).await.is_err() {
        state.remove(&id);
        return (StatusCode::NOT_FOUND, "Could not find session");
    }
    (StatusCode::ACCEPTED, "Accepted")
}

/// Binds the SSE listener on all interfaces.
///
/// # Errors
///
/// Returns [`ServerError::TransportBind`] if the port cannot be bound.
pub async fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::TransportBind { addr, source })
}

/// Accepts SSE connections until the state's shutdown token fires.
///
/// Session tasks may still be running on return; see [`SseState::drain`].
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve(listener: TcpListener, state: SseState) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Serving MCP over SSE");
    }

    let shutdown = state.inner.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Transport)
}
