//! stdio transport for MCP server.
//!
//! This module implements the stdio transport as specified by MCP:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from client
//! - stdout: sends messages to client
//! - stderr: may be used for logging (not MCP messages)
//!
//! The reader and writer are generic so a session can be driven over any
//! byte stream, which is how the tests exercise it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::mcp::server::ProtocolServer;
use crate::mcp::session::{Inbound, Outbound, ProtocolSession, SessionHandle};

/// Session id used in logs for the single stdio session.
pub const STDIO_SESSION_ID: &str = "stdio";

/// Reads newline-delimited messages.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
}

impl<R> LineReader<R> {
    /// Wraps a buffered reader.
    pub const fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Inbound for LineReader<R> {
    async fn next_message(&mut self) -> Result<Option<String>, SessionError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            // EOF - peer closed
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }
}

/// Writes newline-terminated messages, one writer at a time.
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W> LineWriter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Outbound for LineWriter<W> {
    async fn send(&self, message: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !message.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.closed.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Runs one session over the given streams until EOF or shutdown.
///
/// # Errors
///
/// Returns an error if reading or writing the streams fails.
pub async fn serve_streams<R, W>(
    server: Arc<ProtocolServer>,
    reader: R,
    writer: W,
    shutdown: &CancellationToken,
) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handle = SessionHandle::new(STDIO_SESSION_ID, Arc::new(LineWriter::new(writer)));
    let mut inbound = LineReader::new(reader);
    ProtocolSession::new(server, handle)
        .run(&mut inbound, shutdown)
        .await
}

/// Runs the single stdio session over the process's stdin and stdout.
///
/// # Errors
///
/// Returns an error if stdin or stdout fails.
pub async fn serve(
    server: Arc<ProtocolServer>,
    shutdown: &CancellationToken,
) -> Result<(), SessionError> {
    tracing::info!("Serving MCP over stdio");
    serve_streams(
        server,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}
