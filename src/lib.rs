//! mcp-scaffold: serve pluggable tool modules over the Model Context Protocol
//!
//! A host crate implements [`mcp::module::ModuleCapability`] for its tools
//! and prompts, declares its startup parameters, and hands a factory to
//! [`framework::Framework`]. The scaffold supplies the rest:
//!
//! - **Protocol**: JSON-RPC 2.0 dispatch of `initialize`, `tools/*`,
//!   `prompts/*` and `resources/list`, with tool failures reported in-band
//! - **Transports**: newline-delimited stdio, or HTTP with server-sent
//!   events and one session per client
//! - **Configuration**: CLI flags, a piped `start`/`help` handshake,
//!   interactive prompts and the last-used values, in that order
//! - **Lifecycle**: signals and parent death drain sessions, with a forced
//!   exit if draining stalls
//!
//! # Modules
//!
//! - [`cli`]: command line, including per-parameter flags
//! - [`config`]: parameters, handshake and configuration resolution
//! - [`error`]: error types
//! - [`framework`]: process entry point
//! - [`hello`]: a minimal example module
//! - [`lifecycle`]: shutdown coordination
//! - [`logging`]: tracing setup
//! - [`mcp`]: protocol types, sessions and the protocol server
//! - [`supervisor`]: serve loop for the chosen transport
//! - [`transport`]: stdio and SSE transports

pub mod cli;
pub mod config;
pub mod error;
pub mod framework;
pub mod hello;
pub mod lifecycle;
pub mod logging;
pub mod mcp;
pub mod supervisor;
pub mod transport;
