//! Model Context Protocol (MCP) server implementation.
//!
//! This module implements the MCP request surface for a pluggable tool
//! module. Messages are JSON-RPC 2.0; the transport that carries them lives
//! in [`crate::transport`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ProtocolServer                        │
//! │        (one per process, owns the ModuleCapability)          │
//! │                                                              │
//! │   ┌─────────────────┐  ┌─────────────────┐                   │
//! │   │ ProtocolSession │  │ ProtocolSession │  ...one per peer  │
//! │   │   (handshake)   │  │   (handshake)   │                   │
//! │   └────────┬────────┘  └────────┬────────┘                   │
//! │            ▼                    ▼                            │
//! │   ┌─────────────────────────────────────────────┐            │
//! │   │  RequestContext ─▶ ToolContext ─▶ module    │            │
//! │   │  (log + progress back to the calling peer)  │            │
//! │   └─────────────────────────────────────────────┘            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! Sessions negotiate one of [`protocol::SUPPORTED_PROTOCOL_VERSIONS`].

pub mod context;
pub mod module;
pub mod protocol;
pub mod server;
pub mod session;
pub mod types;

pub use context::{RequestContext, ToolContext};
pub use module::{ChangeListener, ChangeListeners, ModuleCapability, PromptOverrides};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, LATEST_PROTOCOL_VERSION};
pub use server::ProtocolServer;
pub use session::{Inbound, Outbound, ProtocolSession, SessionHandle, SessionState};
pub use types::{CallToolResult, PromptArgument, PromptContent, PromptMessage, PromptTemplate, Role, Tool};
