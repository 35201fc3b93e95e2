//! Per-request context handed to tool implementations.
//!
//! [`RequestContext`] is what the transport knows about one invocation: the
//! request id, the progress token the caller may have supplied, and the
//! session the request arrived on. [`ToolContext`] borrows it and adds log
//! and progress helpers that write to the local tracing sink first and then
//! forward to the caller over the session, never failing the tool when the
//! caller has gone away.

use crate::mcp::protocol::{LogLevel, ProgressToken, RequestId};
use crate::mcp::session::SessionHandle;

/// Logger name used by the shorthand log helpers.
pub const DEFAULT_LOGGER: &str = "default";

/// Transport-level facts about a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    progress_token: Option<ProgressToken>,
    session: Option<SessionHandle>,
}

impl RequestContext {
    /// Creates a context for a request.
    #[must_use]
    pub const fn new(
        request_id: RequestId,
        progress_token: Option<ProgressToken>,
        session: Option<SessionHandle>,
    ) -> Self {
        Self {
            request_id,
            progress_token,
            session,
        }
    }

    /// The JSON-RPC id of the request.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Progress token supplied by the caller, if it asked for progress.
    #[must_use]
    pub const fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// The session the request arrived on.
    #[must_use]
    pub const fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// The session, if it can still accept notifications.
    fn live_session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().filter(|s| !s.is_closed())
    }
}

/// Logging and progress surface for tool implementations.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    inner: &'a RequestContext,
}

impl<'a> ToolContext<'a> {
    /// Wraps a request context.
    #[must_use]
    pub const fn new(inner: &'a RequestContext) -> Self {
        Self { inner }
    }

    /// The wrapped request context.
    #[must_use]
    pub const fn inner(&self) -> &'a RequestContext {
        self.inner
    }

    /// The JSON-RPC id of the request being served.
    #[must_use]
    pub const fn request_id(&self) -> &'a RequestId {
        self.inner.request_id()
    }

    /// Logs a message locally and forwards it to the caller.
    pub async fn log(&self, level: LogLevel, message: &str, logger: &str) {
        let request_id = self.inner.request_id();
        match level {
            LogLevel::Debug => tracing::debug!(logger, %request_id, "{message}"),
            LogLevel::Info => tracing::info!(logger, %request_id, "{message}"),
            LogLevel::Warning => tracing::warn!(logger, %request_id, "{message}"),
            LogLevel::Error => tracing::error!(logger, %request_id, "{message}"),
        }

        let Some(session) = self.inner.live_session() else {
            return;
        };
        if let Err(e) = session.send_log_message(level, logger, message).await {
            tracing::error!(
                session = %session.id(),
                error = %e,
                "Failed to forward log message to client"
            );
        }
    }

    /// Logs at info level under the default logger.
    pub async fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, DEFAULT_LOGGER).await;
    }

    /// Logs at warning level under the default logger.
    pub async fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message, DEFAULT_LOGGER).await;
    }

    /// Logs at error level under the default logger.
    pub async fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, DEFAULT_LOGGER).await;
    }

    /// Logs at debug level under the default logger.
    pub async fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, DEFAULT_LOGGER).await;
    }

    /// Reports progress to the caller.
    ///
    /// Does nothing unless the caller supplied a progress token.
    pub async fn report_progress(&self, progress: f64, total: Option<f64>) {
        let Some(token) = self.inner.progress_token() else {
            return;
        };
        let Some(session) = self.inner.live_session() else {
            return;
        };
        if let Err(e) = session.send_progress(token, progress, total).await {
            tracing::error!(
                session = %session.id(),
                error = %e,
                "Failed to forward progress to client"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::mcp::session::Outbound;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Outbound for Recorder {
        async fn send(&self, message: String) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Outbound for Broken {
        async fn send(&self, _message: String) -> Result<(), SessionError> {
            Err(SessionError::Closed)
        }
    }

    fn context(token: Option<ProgressToken>, outbound: Arc<dyn Outbound>) -> RequestContext {
        RequestContext::new(
            RequestId::Number(1),
            token,
            Some(SessionHandle::new("test", outbound)),
        )
    }

    #[tokio::test]
    async fn info_is_forwarded_as_log_notification() {
        let recorder = Arc::new(Recorder::default());
        let ctx = context(None, recorder.clone());
        ToolContext::new(&ctx).info("working").await;

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["method"], "notifications/message");
        assert_eq!(value["params"]["level"], "info");
        assert_eq!(value["params"]["logger"], "default");
        assert_eq!(value["params"]["data"], "working");
    }

    #[tokio::test]
    async fn progress_without_token_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let ctx = context(None, recorder.clone());
        ToolContext::new(&ctx).report_progress(1.0, Some(2.0)).await;
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_with_token_is_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let ctx = context(Some(ProgressToken::Number(9)), recorder.clone());
        ToolContext::new(&ctx).report_progress(1.0, Some(2.0)).await;

        let sent = recorder.sent.lock().unwrap();
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["params"]["progressToken"], 9);
        assert_eq!(value["params"]["total"], 2.0);
    }

    /// Collects formatted tracing output.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        /// Installs a subscriber writing here for the current thread.
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn line_containing(&self, needle: &str) -> String {
            let output = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            output
                .lines()
                .find(|line| line.contains(needle))
                .unwrap_or_else(|| panic!("no log line containing {needle:?} in:\n{output}"))
                .to_string()
        }
    }

    #[tokio::test]
    async fn failed_log_forwarding_still_logs_locally() {
        let captured = Captured::default();
        let _guard = captured.install();

        let ctx = context(None, Arc::new(Broken));
        ToolContext::new(&ctx).info("still logged locally").await;

        let local = captured.line_containing("still logged locally");
        assert!(local.contains("INFO"), "{local}");
        assert!(local.contains(r#"logger="default""#), "{local}");

        let failure = captured.line_containing("Failed to forward log message to client");
        assert!(failure.contains("ERROR"), "{failure}");
        assert!(failure.contains("session=test"), "{failure}");
    }

    #[tokio::test]
    async fn failed_progress_forwarding_is_logged() {
        let captured = Captured::default();
        let _guard = captured.install();

        let ctx = context(Some(ProgressToken::Number(1)), Arc::new(Broken));
        ToolContext::new(&ctx).report_progress(0.5, None).await;

        let failure = captured.line_containing("Failed to forward progress to client");
        assert!(failure.contains("ERROR"), "{failure}");
        assert!(failure.contains("session=test"), "{failure}");
    }

    #[tokio::test]
    async fn no_session_is_local_only() {
        let ctx = RequestContext::new(RequestId::String("a".to_string()), None, None);
        let tool = ToolContext::new(&ctx);
        tool.warning("nobody listening").await;
        assert_eq!(tool.request_id(), &RequestId::String("a".to_string()));
        assert!(tool.inner().session().is_none());
    }
}
