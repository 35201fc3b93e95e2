//! Startup configuration: where values come from and how they are merged.
//!
//! # Sources
//!
//! For the SSE transport, each value is taken from the first source that
//! has it:
//!
//! 1. The `start` handshake piped to stdin
//! 2. The matching CLI flag
//! 3. An interactive prompt (interactive parameters and the port), offering
//!    the last-used value or the declared default
//! 4. The last-used value, else the declared default
//!
//! The stdio transport owns stdin for the protocol, so it only looks at CLI
//! flags and declared defaults.
//!
//! # Persisted Values
//!
//! Values used for an SSE run are saved to:
//!
//! - **Linux/macOS:** `~/.<server-name>/config.json`
//! - **Windows:** `%USERPROFILE%\.<server-name>\config.json`

mod handshake;
mod prompt;
mod settings;

pub use handshake::{help_response, parse_handshake, parse_port, strip_bom, Handshake, StartRequest};
pub use prompt::{ask_with, Prompter, StdinPrompter};
#[cfg(test)]
pub(crate) use prompt::ScriptedPrompter;
pub use settings::{LastUsedConfig, ModuleParameter, ModuleParams, ParamKind, ServerMetadata};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;
use crate::transport::{TransportKind, DEFAULT_PORT};

/// Returns the configuration directory for a server.
///
/// - **Linux/macOS:** `~/.<server-name>/`
/// - **Windows:** `%USERPROFILE%\.<server-name>\`
#[must_use]
pub fn default_config_dir(server_name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(format!(".{server_name}")))
}

/// Path of the persisted last-used configuration inside `dir`.
#[must_use]
pub fn config_file(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

/// Loads the last-used configuration.
///
/// A missing file yields empty defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_last_used(path: &Path) -> Result<LastUsedConfig, ConfigError> {
    if !path.exists() {
        return Ok(LastUsedConfig::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(strip_bom(&contents)).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Writes the last-used configuration, creating its directory if needed.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save_last_used(path: &Path, config: &LastUsedConfig) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(path, json).map_err(write_error)
}

/// Values gathered before resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// `--port`, if given.
    pub cli_port: Option<u16>,
    /// `--<param>` values as typed on the command line.
    pub cli_params: HashMap<String, String>,
    /// The `start` handshake, if one was piped in.
    pub handshake: Option<StartRequest>,
    /// Values from the previous run.
    pub last_used: LastUsedConfig,
}

/// Fully resolved startup values.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupConfig {
    /// Transport to serve on.
    pub transport: TransportKind,
    /// Port for the SSE transport.
    pub port: Option<u16>,
    /// Module parameter values.
    pub params: ModuleParams,
}

impl StartupConfig {
    /// The record to persist for the next run.
    #[must_use]
    pub fn last_used(&self) -> LastUsedConfig {
        LastUsedConfig::from_resolved(self.port, &self.params)
    }
}

/// Merges every source into the final startup values.
///
/// # Errors
///
/// Returns an error if a supplied value cannot be converted to its declared
/// type.
pub fn resolve(
    transport: TransportKind,
    parameters: &[ModuleParameter],
    sources: &ConfigSources,
    prompter: &mut dyn Prompter,
) -> Result<StartupConfig, ConfigError> {
    match transport {
        TransportKind::Stdio => resolve_stdio(parameters, sources),
        TransportKind::Sse => resolve_sse(parameters, sources, prompter),
    }
}

fn resolve_stdio(
    parameters: &[ModuleParameter],
    sources: &ConfigSources,
) -> Result<StartupConfig, ConfigError> {
    let mut params = ModuleParams::new();
    for param in parameters {
        if let Some(raw) = sources.cli_params.get(&param.name) {
            params.insert(param.name.clone(), param.kind.parse(&param.name, raw)?);
        } else if let Some(default) = &param.default {
            params.insert(param.name.clone(), param.kind.coerce(&param.name, default)?);
        }
    }

    Ok(StartupConfig {
        transport: TransportKind::Stdio,
        port: None,
        params,
    })
}

fn resolve_sse(
    parameters: &[ModuleParameter],
    sources: &ConfigSources,
    prompter: &mut dyn Prompter,
) -> Result<StartupConfig, ConfigError> {
    let port = match sources
        .handshake
        .as_ref()
        .and_then(|h| h.port)
        .or(sources.cli_port)
    {
        Some(port) => port,
        None => {
            let default = sources.last_used.port.unwrap_or(DEFAULT_PORT);
            let answer = prompter.ask("Please enter the server port", &default.to_string());
            parse_port(&Value::String(answer))?
        }
    };

    let mut params = ModuleParams::new();
    for param in parameters {
        let value = resolve_param(param, sources, prompter)?;
        params.insert(param.name.clone(), value);
    }

    Ok(StartupConfig {
        transport: TransportKind::Sse,
        port: Some(port),
        params,
    })
}

fn resolve_param(
    param: &ModuleParameter,
    sources: &ConfigSources,
    prompter: &mut dyn Prompter,
) -> Result<Value, ConfigError> {
    let name = param.name.as_str();

    let supplied = sources
        .handshake
        .as_ref()
        .and_then(|h| h.params.get(name))
        .filter(|v| !v.is_null());
    if let Some(value) = supplied {
        return param.kind.coerce(name, value);
    }

    if let Some(raw) = sources.cli_params.get(name) {
        return param.kind.parse(name, raw);
    }

    let saved = sources.last_used.params.get(name).filter(|v| !v.is_null());

    if param.interactive {
        let default = saved.map_or_else(|| param.default_display(), display_value);
        let answer = prompter.ask(&format!("Please enter {}", param.help), &default);
        return param.kind.parse(name, &answer);
    }

    match saved.or(param.default.as_ref()) {
        Some(value) => param.kind.coerce(name, value),
        None => Ok(Value::String(String::new())),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
