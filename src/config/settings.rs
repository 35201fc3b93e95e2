//! Configuration structures.
//!
//! [`ModuleParameter`] is how a module declares the startup values it needs;
//! [`ModuleParams`] is what it receives once every source has been merged.
//! [`LastUsedConfig`] maps directly to the persisted JSON file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ConfigError;

/// Primitive type of a module parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Free text.
    Str,
    /// Signed integer.
    Int,
    /// Floating point number.
    Float,
    /// Boolean flag.
    Bool,
}

impl ParamKind {
    /// Short name used in CLI help and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }

    /// JSON Schema type name.
    #[must_use]
    pub const fn json_type(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Float => "number",
            Self::Bool => "boolean",
        }
    }

    /// Converts raw text (CLI flag, prompt answer) to a typed value.
    ///
    /// Booleans accept `yes`, `true`, `t` and `1` (any case) as true; any
    /// other text is false.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid number for numeric kinds.
    pub fn parse(self, name: &str, raw: &str) -> Result<Value, ConfigError> {
        let raw = raw.trim();
        let invalid = || ConfigError::InvalidParameter {
            name: name.to_string(),
            value: raw.to_string(),
            expected: self.name(),
        };

        match self {
            Self::Str => Ok(Value::String(raw.to_string())),
            Self::Int => raw.parse::<i64>().map(Value::from).map_err(|_| invalid()),
            Self::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            Self::Bool => Ok(Value::Bool(is_truthy(raw))),
        }
    }

    /// Converts a JSON value (handshake, persisted file) to this kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot represent this kind.
    pub fn coerce(self, name: &str, value: &Value) -> Result<Value, ConfigError> {
        match (self, value) {
            (Self::Str, Value::String(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::Float, Value::Number(_)) => Ok(value.clone()),
            (Self::Int, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
            (_, Value::String(s)) => self.parse(name, s),
            (_, other) => self.parse(name, &other.to_string()),
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "yes" | "true" | "t" | "1"
    )
}

/// A startup value a module declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParameter {
    /// Parameter name, also the CLI flag (`--<name>`).
    pub name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// Help text, also used as the interactive question.
    pub help: String,
    /// Declared default.
    #[serde(default)]
    pub default: Option<Value>,
    /// Whether SSE startup asks for this value interactively.
    #[serde(default = "default_true")]
    pub interactive: bool,
}

const fn default_true() -> bool {
    true
}

impl ModuleParameter {
    /// Declares an interactive parameter without a default.
    pub fn new(name: impl Into<String>, kind: ParamKind, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            help: help.into(),
            default: None,
            interactive: true,
        }
    }

    /// Sets the declared default.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Never asks for this value interactively.
    #[must_use]
    pub const fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    /// Default rendered for display (prompts, help output).
    #[must_use]
    pub fn default_display(&self) -> String {
        match &self.default {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    /// JSON Schema property describing this parameter.
    #[must_use]
    pub fn schema(&self) -> Value {
        serde_json::json!({
            "type": self.kind.json_type(),
            "description": self.help,
            "default": self.default.clone().unwrap_or_else(|| Value::String(String::new())),
        })
    }
}

/// Resolved module parameter values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleParams(BTreeMap<String, Value>);

impl ModuleParams {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Raw value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// String value by name.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Integer value by name.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// Floating point value by name.
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    /// Boolean value by name.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Iterates values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no value is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for ModuleParams {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Values used on the previous run, offered as defaults on the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastUsedConfig {
    /// Port of the last SSE run.
    #[serde(default)]
    pub port: Option<u16>,
    /// Module parameter values keyed by name.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl LastUsedConfig {
    /// Builds the record for a resolved SSE startup.
    #[must_use]
    pub fn from_resolved(port: Option<u16>, params: &ModuleParams) -> Self {
        Self {
            port,
            params: params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// Descriptive facts about the server shown in the banner, the help
/// handshake and the `initialize` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMetadata {
    /// Server name; also names the config directory and log file.
    pub name: String,
    /// Server version.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Author credit.
    pub author: String,
    /// Project URL.
    pub github: String,
}

impl ServerMetadata {
    /// Creates metadata with empty author and URL.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            author: String::new(),
            github: String::new(),
        }
    }

    /// Sets the author credit.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Sets the project URL.
    #[must_use]
    pub fn with_github(mut self, github: impl Into<String>) -> Self {
        self.github = github.into();
        self
    }
}
