//! Process entry point shared by every server binary.
//!
//! A host describes its server with [`Framework`] and hands over a factory
//! for its module; [`Framework::run`] does everything else: command line,
//! logging, startup handshake, configuration, runtime, signals and exit code.

use std::ffi::OsString;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::{self, Cli};
use crate::config::{
    self, help_response, parse_handshake, ConfigSources, Handshake, LastUsedConfig,
    ModuleParameter, ModuleParams, ServerMetadata, StartupConfig, StdinPrompter,
};
use crate::error::{ConfigError, ModuleError, ServerError};
use crate::lifecycle::{parent_pid, LifecycleController, OsParentProbe, Shutdown};
use crate::logging;
use crate::mcp::module::{ModuleCapability, PromptOverrides};
use crate::mcp::types::ServerInfo;
use crate::supervisor::TransportSupervisor;
use crate::transport::{TransportKind, DEFAULT_PORT};

/// How long runtime teardown waits for blocked reads (stdin) to return.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Describes a server and runs it.
#[derive(Debug)]
pub struct Framework {
    metadata: ServerMetadata,
    parameters: Vec<ModuleParameter>,
    prompts: PromptOverrides,
    instructions: Option<String>,
    config_dir: Option<PathBuf>,
}

/// Outcome of the pre-runtime startup steps.
enum Startup {
    Serve(StartupConfig),
    Exit(ExitCode),
}

impl Framework {
    /// Creates a framework for a server with no parameters.
    #[must_use]
    pub fn new(metadata: ServerMetadata) -> Self {
        Self {
            metadata,
            parameters: Vec::new(),
            prompts: PromptOverrides::none(),
            instructions: None,
            config_dir: None,
        }
    }

    /// Declares one module parameter.
    #[must_use]
    pub fn parameter(mut self, parameter: ModuleParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Declares module parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: impl IntoIterator<Item = ModuleParameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Serves prompts from these handlers instead of the module.
    #[must_use]
    pub fn prompt_overrides(mut self, prompts: PromptOverrides) -> Self {
        self.prompts = prompts;
        self
    }

    /// Sets the instructions returned from `initialize`. Defaults to the
    /// server description.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Overrides the directory holding `config.json` and `logs/`.
    #[must_use]
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Runs with the process's own arguments.
    pub fn run<M, F>(self, factory: F) -> ExitCode
    where
        M: ModuleCapability + 'static,
        F: FnOnce(&ModuleParams) -> Result<M, ModuleError>,
    {
        self.run_with_args(std::env::args_os(), factory)
    }

    /// Runs with explicit arguments (program name first).
    pub fn run_with_args<I, T, M, F>(self, args: I, factory: F) -> ExitCode
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
        M: ModuleCapability + 'static,
        F: FnOnce(&ModuleParams) -> Result<M, ModuleError>,
    {
        if let Err(e) = cli::validate_parameters(&self.parameters) {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }

        let cli = match cli::parse_from(&self.metadata, &self.parameters, args) {
            Ok(cli) => cli,
            Err(e) => {
                if let Err(err) = e.print() {
                    tracing::debug!(error = %err, "Failed to print CLI output");
                }
                return if e.use_stderr() {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                };
            }
        };

        let config_dir = self
            .config_dir
            .clone()
            .or_else(|| config::default_config_dir(&self.metadata.name));
        let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
        let _guard = logging::init_tracing(cli.log_level.level(), log_dir.as_deref(), &self.metadata.name);

        tracing::debug!(transport = %cli.transport, "Starting {}", self.metadata.name);

        let config = match self.startup(&cli, config_dir.as_deref()) {
            Ok(Startup::Serve(config)) => config,
            Ok(Startup::Exit(code)) => return code,
            Err(e) => {
                tracing::error!(error = %e, "Startup configuration failed");
                return ExitCode::FAILURE;
            }
        };

        self.print_banner(&config);

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create Tokio runtime");
                return ExitCode::FAILURE;
            }
        };

        let result = runtime.block_on(self.serve(&config, factory));
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

        match result {
            Ok(()) => {
                tracing::info!("Server stopped");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Server error");
                ExitCode::FAILURE
            }
        }
    }

    /// Reads the handshake and resolves configuration.
    fn startup(&self, cli: &Cli, config_dir: Option<&Path>) -> Result<Startup, ConfigError> {
        let mut sources = ConfigSources {
            cli_port: cli.port,
            cli_params: cli.params.clone(),
            ..ConfigSources::default()
        };

        if cli.transport == TransportKind::Sse {
            match read_handshake()? {
                Some(Handshake::Help(id)) => {
                    let help = help_response(&id, &self.metadata, &self.parameters);
                    match serde_json::to_string_pretty(&help) {
                        Ok(text) => println!("{text}"),
                        Err(e) => tracing::error!(error = %e, "Failed to serialise help"),
                    }
                    return Ok(Startup::Exit(ExitCode::SUCCESS));
                }
                Some(Handshake::Start(start)) => sources.handshake = Some(start),
                None => {}
            }
        }

        let config_path = config_dir.map(config::config_file);
        if cli.transport == TransportKind::Sse {
            sources.last_used = config_path
                .as_deref()
                .map(load_last_used)
                .unwrap_or_default();
        }

        let resolved = config::resolve(
            cli.transport,
            &self.parameters,
            &sources,
            &mut StdinPrompter,
        )?;

        if resolved.transport == TransportKind::Sse {
            if let Some(path) = &config_path {
                match config::save_last_used(path, &resolved.last_used()) {
                    Ok(()) => tracing::debug!(path = %path.display(), "Saved configuration"),
                    Err(e) => tracing::warn!(error = %e, "Failed to save configuration"),
                }
            }
        }

        Ok(Startup::Serve(resolved))
    }

    async fn serve<M, F>(&self, config: &StartupConfig, factory: F) -> Result<(), ServerError>
    where
        M: ModuleCapability + 'static,
        F: FnOnce(&ModuleParams) -> Result<M, ModuleError>,
    {
        let lifecycle = LifecycleController::new(Shutdown::new());
        let _signals = lifecycle.install_signal_handlers()?;

        if config.transport == TransportKind::Stdio {
            if let Some(pid) = parent_pid().filter(|pid| *pid > 1) {
                let _watcher = lifecycle.watch_parent(pid, Arc::new(OsParentProbe));
            }
        }

        let mut supervisor =
            TransportSupervisor::new(ServerInfo::new(&self.metadata.name, &self.metadata.version), lifecycle)
                .with_prompt_overrides(self.prompts.clone());
        let instructions = self
            .instructions
            .clone()
            .unwrap_or_else(|| self.metadata.description.clone());
        if !instructions.is_empty() {
            supervisor = supervisor.with_instructions(instructions);
        }

        supervisor.run(config, factory).await
    }

    fn print_banner(&self, config: &StartupConfig) {
        let meta = &self.metadata;
        eprintln!("{} v{}", meta.name, meta.version);
        if !meta.description.is_empty() {
            eprintln!("{}", meta.description);
        }
        if !meta.author.is_empty() {
            eprintln!("Author: {}", meta.author);
        }
        if !meta.github.is_empty() {
            eprintln!("GitHub: {}", meta.github);
        }
        match config.transport {
            TransportKind::Stdio => eprintln!("Serving on stdio"),
            TransportKind::Sse => eprintln!(
                "Serving SSE on http://127.0.0.1:{}/ (Ctrl+C to stop)",
                config.port.unwrap_or(DEFAULT_PORT)
            ),
        }
    }
}

/// Reads a startup handshake from stdin when it is piped.
///
/// A malformed handshake is logged and ignored; a well-formed one that asks
/// for something unsupported is an error.
fn read_handshake() -> Result<Option<Handshake>, ConfigError> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    if let Err(e) = stdin.read_to_string(&mut input) {
        tracing::warn!(error = %e, "Failed to read startup handshake");
        return Ok(None);
    }

    match parse_handshake(&input) {
        Ok(handshake) => Ok(handshake),
        Err(e @ ConfigError::Handshake { .. }) => {
            tracing::warn!(error = %e, "Ignoring startup input");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn load_last_used(path: &Path) -> LastUsedConfig {
    match config::load_last_used(path) {
        Ok(saved) => saved,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring saved configuration");
            LastUsedConfig::default()
        }
    }
}
