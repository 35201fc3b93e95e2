//! Command-line interface.
//!
//! The fixed flags come from the [`Cli`] derive; one `--<name>` flag per
//! declared module parameter is added at runtime with the builder API.

use std::collections::HashMap;
use std::ffi::OsString;

use clap::{Arg, CommandFactory, FromArgMatches, Parser, ValueEnum};
use tracing::Level;

use crate::config::{ModuleParameter, ServerMetadata};
use crate::error::ConfigError;
use crate::transport::TransportKind;

/// Flag names owned by the framework; module parameters may not reuse them.
pub const RESERVED_FLAGS: &[&str] = &["transport", "port", "log-level", "help", "version"];

/// Parsed command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-server", version, about)]
pub struct Cli {
    /// Transport to serve on
    #[arg(long, value_enum, default_value_t = TransportKind::Sse)]
    pub transport: TransportKind,

    /// Port for the SSE transport
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Log level
    #[arg(long, value_enum, ignore_case = true, default_value_t = LogLevelArg::Info)]
    pub log_level: LogLevelArg,

    /// Module parameter values as typed, keyed by parameter name.
    #[arg(skip)]
    pub params: HashMap<String, String>,
}

/// Values accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    /// Debug output.
    #[value(name = "DEBUG")]
    Debug,
    /// Informational output.
    #[value(name = "INFO")]
    Info,
    /// Warnings only.
    #[value(name = "WARNING")]
    Warning,
    /// Errors only.
    #[value(name = "ERROR")]
    Error,
    /// Treated as `ERROR`.
    #[value(name = "CRITICAL")]
    Critical,
}

impl LogLevelArg {
    /// The tracing level this maps to.
    #[must_use]
    pub const fn level(self) -> Level {
        match self {
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

/// Rejects module parameters whose flag would collide with another flag.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the first clash.
pub fn validate_parameters(parameters: &[ModuleParameter]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for param in parameters {
        if param.name.is_empty() || param.name.starts_with('-') {
            return Err(ConfigError::ValidationError {
                message: format!("'{}' is not a valid parameter name", param.name),
            });
        }
        if RESERVED_FLAGS.contains(&param.name.as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!("parameter '{}' clashes with a built-in flag", param.name),
            });
        }
        if !seen.insert(param.name.as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!("parameter '{}' is declared twice", param.name),
            });
        }
    }
    Ok(())
}

/// Builds the full command for a server.
#[must_use]
pub fn command(metadata: &ServerMetadata, parameters: &[ModuleParameter]) -> clap::Command {
    let mut cmd = Cli::command()
        .name(metadata.name.clone())
        .version(metadata.version.clone())
        .about(metadata.description.clone());

    for param in parameters {
        cmd = cmd.arg(
            Arg::new(param.name.clone())
                .long(param.name.clone())
                .value_name(param.kind.name().to_uppercase())
                .help(param.help.clone()),
        );
    }
    cmd
}

/// Parses `args` (program name first).
///
/// # Errors
///
/// Returns the clap error for unknown flags or bad values, and for
/// `--help`/`--version`, which the caller prints.
pub fn parse_from<I, T>(
    metadata: &ServerMetadata,
    parameters: &[ModuleParameter],
    args: I,
) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command(metadata, parameters).try_get_matches_from(args)?;
    let mut cli = Cli::from_arg_matches(&matches)?;
    for param in parameters {
        if let Some(value) = matches.get_one::<String>(&param.name) {
            cli.params.insert(param.name.clone(), value.clone());
        }
    }
    Ok(cli)
}
