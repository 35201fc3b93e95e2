//! Runs the protocol server over the configured transport.
//!
//! The supervisor moves through `Idle → Initializing → Serving → Draining →
//! Stopped`:
//!
//! - **Initializing**: the module is built by the host's factory and its
//!   `initialize` awaited; any failure aborts startup
//! - **Serving**: one stdio session, or an HTTP listener spawning one session
//!   per SSE client
//! - **Draining**: entered when the shared shutdown token fires or the
//!   serve loop fails; open sessions are allowed to unwind
//! - **Stopped**: the lifecycle controller is told draining is complete

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::config::{ModuleParams, StartupConfig};
use crate::error::{ModuleError, ServerError};
use crate::lifecycle::{LifecycleController, ShutdownReason};
use crate::mcp::module::{ModuleCapability, PromptOverrides};
use crate::mcp::server::ProtocolServer;
use crate::mcp::types::ServerInfo;
use crate::transport::{sse, stdio, TransportKind, DEFAULT_PORT};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not started.
    Idle,
    /// Building and initialising the module.
    Initializing,
    /// Transport loop running.
    Serving,
    /// Sessions unwinding.
    Draining,
    /// Done.
    Stopped,
}

/// Owns the serve loop for one transport.
#[derive(Debug)]
pub struct TransportSupervisor {
    info: ServerInfo,
    instructions: Option<String>,
    prompts: PromptOverrides,
    lifecycle: LifecycleController,
    state: SupervisorState,
}

impl TransportSupervisor {
    /// Creates an idle supervisor.
    #[must_use]
    pub fn new(info: ServerInfo, lifecycle: LifecycleController) -> Self {
        Self {
            info,
            instructions: None,
            prompts: PromptOverrides::none(),
            lifecycle,
            state: SupervisorState::Idle,
        }
    }

    /// Sets the instructions returned from `initialize`.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Installs external prompt handlers.
    #[must_use]
    pub fn with_prompt_overrides(mut self, prompts: PromptOverrides) -> Self {
        self.prompts = prompts;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// The lifecycle controller shutdown is driven through.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = ?self.state, to = ?next, "Supervisor state change");
        self.state = next;
    }

    /// Initialises a module and serves it on the configured transport until
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if initialisation fails, the listener cannot be bound,
    /// or the serve loop fails.
    pub async fn run<M, F>(&mut self, config: &StartupConfig, factory: F) -> Result<(), ServerError>
    where
        M: ModuleCapability + 'static,
        F: FnOnce(&ModuleParams) -> Result<M, ModuleError>,
    {
        let server = self.initialize(&config.params, factory).await?;

        match config.transport {
            TransportKind::Stdio => self.serve_stdio(server).await,
            TransportKind::Sse => {
                let listener = match sse::bind(config.port.unwrap_or(DEFAULT_PORT)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to start SSE transport");
                        self.transition(SupervisorState::Stopped);
                        return Err(e);
                    }
                };
                self.serve_sse(listener, server).await
            }
        }
    }

    /// Builds the module, awaits its `initialize` and wraps it in a
    /// [`ProtocolServer`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Initialization`] if the factory or `initialize`
    /// fails.
    pub async fn initialize<M, F>(
        &mut self,
        params: &ModuleParams,
        factory: F,
    ) -> Result<Arc<ProtocolServer>, ServerError>
    where
        M: ModuleCapability + 'static,
        F: FnOnce(&ModuleParams) -> Result<M, ModuleError>,
    {
        self.transition(SupervisorState::Initializing);

        let built = async {
            let mut module = factory(params)?;
            module.initialize(params).await?;
            Ok::<_, ModuleError>(module)
        }
        .await;
        let module = match built {
            Ok(module) => module,
            Err(e) => {
                tracing::error!(error = %e, "Module initialisation failed");
                self.transition(SupervisorState::Stopped);
                return Err(ServerError::Initialization(e));
            }
        };

        let mut server = ProtocolServer::new(self.info.clone(), Arc::new(module))
            .with_prompt_overrides(self.prompts.clone());
        if let Some(instructions) = &self.instructions {
            server = server.with_instructions(instructions.clone());
        }

        tracing::info!(tools = server.list_tools().len(), "Module initialised");
        Ok(Arc::new(server))
    }

    /// Serves the single stdio session.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin or stdout fails.
    pub async fn serve_stdio(&mut self, server: Arc<ProtocolServer>) -> Result<(), ServerError> {
        self.transition(SupervisorState::Serving);
        let token = self.lifecycle.shutdown().token();
        let served = stdio::serve(server, &token).await.map_err(ServerError::from);

        self.transition(SupervisorState::Draining);
        self.stop(served)
    }

    /// Serves one session over arbitrary streams.
    ///
    /// # Errors
    ///
    /// Returns an error if the streams fail.
    pub async fn serve_streams<R, W>(
        &mut self,
        server: Arc<ProtocolServer>,
        reader: R,
        writer: W,
    ) -> Result<(), ServerError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.transition(SupervisorState::Serving);
        let token = self.lifecycle.shutdown().token();
        let served = stdio::serve_streams(server, reader, writer, &token)
            .await
            .map_err(ServerError::from);

        self.transition(SupervisorState::Draining);
        self.stop(served)
    }

    /// Serves SSE sessions on a bound listener until shutdown, then waits for
    /// every session to unwind.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.
    pub async fn serve_sse(
        &mut self,
        listener: TcpListener,
        server: Arc<ProtocolServer>,
    ) -> Result<(), ServerError> {
        self.transition(SupervisorState::Serving);
        let state = sse::SseState::new(server, self.lifecycle.shutdown().token());
        let served = sse::serve(listener, state.clone()).await;

        self.transition(SupervisorState::Draining);
        if served.is_err() {
            // Make sure session tasks see the token before we wait on them.
            self.lifecycle.shutdown().token().cancel();
        }
        state.drain().await;
        self.stop(served)
    }

    fn stop(&mut self, served: Result<(), ServerError>) -> Result<(), ServerError> {
        if let Err(e) = &served {
            tracing::error!(error = %e, "Transport failed");
            self.lifecycle
                .request_shutdown(ShutdownReason::TransportError(e.to_string()));
        }
        self.lifecycle.finish();
        self.transition(SupervisorState::Stopped);
        served
    }
}
