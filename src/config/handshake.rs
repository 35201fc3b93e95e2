//! JSON-RPC shaped startup handshake read from a piped stdin.
//!
//! A launcher that does not want to answer interactive prompts writes one
//! JSON object to the server's stdin before closing it:
//!
//! - `{"jsonrpc":"2.0","method":"help","id":1}` asks for a description of
//!   the server and its `start` parameters
//! - `{"jsonrpc":"2.0","method":"start","params":{...}}` supplies transport,
//!   port and module parameter values

use serde_json::{json, Map, Value};

use crate::config::settings::{ModuleParameter, ServerMetadata};
use crate::error::ConfigError;
use crate::mcp::protocol::RequestId;
use crate::transport::{TransportKind, DEFAULT_PORT};

/// Parameters supplied by a `start` handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    /// Requested port.
    pub port: Option<u16>,
    /// Module parameter values keyed by name.
    pub params: Map<String, Value>,
}

/// A recognised handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    /// Print the help result and exit.
    Help(RequestId),
    /// Start with the given values.
    Start(StartRequest),
}

/// Strips a leading UTF-8 byte order mark.
#[must_use]
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Parses stdin contents as a handshake.
///
/// Returns `Ok(None)` for empty input and for JSON that is neither `help`
/// nor `start`.
///
/// # Errors
///
/// Returns [`ConfigError::Handshake`] if the input is not a well-formed
/// handshake, [`ConfigError::ValidationError`] if `start` asks for a
/// transport other than SSE, and [`ConfigError::InvalidPort`] for a bad port.
pub fn parse_handshake(input: &str) -> Result<Option<Handshake>, ConfigError> {
    let input = strip_bom(input.trim());
    if input.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(input).map_err(|e| ConfigError::Handshake {
        message: format!("stdin is not valid JSON: {e}"),
    })?;

    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Ok(None);
    }

    match value.get("method").and_then(Value::as_str) {
        Some("help") => {
            let Some(id) = value.get("id") else {
                return Ok(None);
            };
            let id = serde_json::from_value(id.clone()).map_err(|_| ConfigError::Handshake {
                message: "help id must be a string or integer".to_string(),
            })?;
            Ok(Some(Handshake::Help(id)))
        }
        Some("start") => {
            let Some(params) = value.get("params").and_then(Value::as_object) else {
                return Ok(None);
            };
            parse_start(params).map(|start| Some(Handshake::Start(start)))
        }
        _ => Ok(None),
    }
}

fn parse_start(params: &Map<String, Value>) -> Result<StartRequest, ConfigError> {
    let transport = match params.get("transport") {
        None | Some(Value::Null) => TransportKind::Sse,
        Some(Value::String(s)) => TransportKind::from_name(s).ok_or_else(|| ConfigError::Handshake {
            message: format!("unknown transport '{s}'"),
        })?,
        Some(other) => {
            return Err(ConfigError::Handshake {
                message: format!("transport must be a string, got {other}"),
            })
        }
    };
    if transport != TransportKind::Sse {
        return Err(ConfigError::ValidationError {
            message: "start over stdin can only select the sse transport".to_string(),
        });
    }

    let port = match params.get("port") {
        None | Some(Value::Null) => DEFAULT_PORT,
        Some(value) => parse_port(value)?,
    };

    let params = params
        .iter()
        .filter(|(k, _)| k.as_str() != "transport" && k.as_str() != "port")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(StartRequest {
        port: Some(port),
        params,
    })
}

/// Parses a port from a JSON number or numeric string.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidPort`] for anything outside 1..=65535.
pub fn parse_port(value: &Value) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        value: value.to_string(),
    };
    let n = match value {
        Value::Number(n) => n.as_u64().ok_or_else(invalid)?,
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    u16::try_from(n)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(invalid)
}

/// Builds the JSON-RPC result printed in answer to `help`.
#[must_use]
pub fn help_response(
    id: &RequestId,
    metadata: &ServerMetadata,
    parameters: &[ModuleParameter],
) -> Value {
    let mut properties = Map::new();
    properties.insert(
        "transport".to_string(),
        json!({
            "type": "string",
            "enum": TransportKind::NAMES,
            "description": "Transport type",
            "default": TransportKind::Sse.name(),
        }),
    );
    properties.insert(
        "port".to_string(),
        json!({
            "type": "integer",
            "description": "Server port (only used when transport=sse)",
            "default": DEFAULT_PORT,
        }),
    );
    for param in parameters {
        properties.insert(param.name.clone(), param.schema());
    }

    json!({
        "jsonrpc": "2.0",
        "result": {
            "type": "mcp",
            "description": metadata.description,
            "author": metadata.author,
            "version": metadata.version,
            "github": metadata.github,
            "transport": TransportKind::NAMES,
            "methods": [
                {
                    "name": "help",
                    "description": "Show this help information."
                },
                {
                    "name": "start",
                    "description": "Start the server",
                    "inputSchema": {
                        "type": "object",
                        "properties": properties,
                    }
                }
            ]
        },
        "id": id,
    })
}
