//! Error types for mcp-scaffold.
//!
//! Failures are grouped by how far they are allowed to travel:
//!
//! - [`ModuleError`] stays inside a single request (encoded in-band for tool
//!   calls, replaced by an empty list for prompt listing).
//! - [`SessionError`] stays inside a single connection.
//! - [`ConfigError`] and [`ServerError`] abort startup or escalate shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving startup configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file could not be written.
    #[error("failed to write configuration file: {path}")]
    WriteError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A module parameter value could not be converted to its declared type.
    #[error("invalid value '{value}' for parameter '{name}': expected {expected}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// The offending value.
        value: String,
        /// Expected type name.
        expected: &'static str,
    },

    /// The server port is not a valid TCP port.
    #[error("invalid port '{value}'")]
    InvalidPort {
        /// The offending value.
        value: String,
    },

    /// The stdin startup handshake was malformed.
    #[error("invalid startup handshake: {message}")]
    Handshake {
        /// Description of the problem.
        message: String,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised by a module while serving a request or initialising.
///
/// The `Display` text is what the caller sees: tool failures are reported as
/// `"Error: <display>"`.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Free-form failure message.
    #[error("{0}")]
    Message(String),

    /// The arguments supplied to a tool were missing or malformed.
    #[error("{0}")]
    InvalidArguments(String),

    /// No tool with this name exists in the catalog.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// No prompt template with this name exists.
    #[error("prompt template not found: {0}")]
    PromptNotFound(String),

    /// JSON (de)serialisation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other error raised by module code.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ModuleError {
    /// Creates a free-form error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wraps an arbitrary error.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(error))
    }
}

/// Errors on a single protocol session (one stdio stream or one SSE client).
///
/// Notification delivery failures are reported with this type too; callers
/// log them and carry on.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The peer has gone away.
    #[error("session closed")]
    Closed,

    /// Reading or writing the stream failed.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outgoing message could not be serialised.
    #[error("failed to serialise message: {0}")]
    Serialise(#[from] serde_json::Error),
}

/// Fatal errors that abort startup or end the serve loop.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Startup configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The module factory or the module's `initialize` failed.
    #[error("module initialisation failed: {0}")]
    Initialization(#[source] ModuleError),

    /// The HTTP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    TransportBind {
        /// Address that was requested.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The single stdio session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Termination signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::ReadError {
            path: PathBuf::from("/path/to/config.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let msg = error.to_string();
        assert!(msg.contains("failed to read"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn invalid_parameter_display() {
        let error = ConfigError::InvalidParameter {
            name: "retries".to_string(),
            value: "many".to_string(),
            expected: "int",
        };
        let msg = error.to_string();
        assert!(msg.contains("retries"));
        assert!(msg.contains("many"));
        assert!(msg.contains("int"));
    }

    #[test]
    fn module_error_message_is_verbatim() {
        assert_eq!(ModuleError::msg("boom").to_string(), "boom");
        assert_eq!(
            ModuleError::InvalidArguments("Missing arguments".to_string()).to_string(),
            "Missing arguments"
        );
    }

    #[test]
    fn module_error_wraps_other() {
        let inner = std::io::Error::other("disk on fire");
        let error = ModuleError::other(inner);
        assert_eq!(error.to_string(), "disk on fire");
    }

    #[test]
    fn transport_bind_display() {
        let error = ServerError::TransportBind {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(error.to_string().contains("0.0.0.0:8080"));
    }
}
