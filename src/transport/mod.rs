//! Transports that carry protocol sessions.
//!
//! - [`stdio`]: one session over the process's stdin/stdout
//! - [`sse`]: one session per HTTP client, messages pushed as server-sent
//!   events and received through `POST /messages/`

pub mod sse;
pub mod stdio;

use clap::ValueEnum;

/// Port used by the SSE transport when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Which transport to serve on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum TransportKind {
    /// Newline-delimited JSON over stdin/stdout.
    Stdio,
    /// HTTP with server-sent events.
    Sse,
}

impl TransportKind {
    /// Wire names of every transport.
    pub const NAMES: &'static [&'static str] = &["stdio", "sse"];

    /// Wire name of this transport.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
        }
    }

    /// Looks a transport up by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stdio" => Some(Self::Stdio),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
