//! A minimal module: one greeting tool and one greeting prompt.
//!
//! Used by the `hello-mcp` binary and as the reference module in the
//! integration tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::{ModuleParameter, ModuleParams, ParamKind, ServerMetadata};
use crate::error::ModuleError;
use crate::mcp::context::ToolContext;
use crate::mcp::module::ModuleCapability;
use crate::mcp::types::{PromptArgument, PromptContent, PromptMessage, PromptTemplate, Role, Tool};

/// Greeting used when none is configured.
pub const DEFAULT_GREETING: &str = "Hello";

/// Name used by the prompt when none is given.
pub const DEFAULT_NAME: &str = "World";

/// Says hello.
#[derive(Debug)]
pub struct HelloWorldModule {
    greeting: String,
}

impl HelloWorldModule {
    /// Creates the module; `initialize` picks up the configured greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
        }
    }

    /// Server identity for the binary.
    #[must_use]
    pub fn metadata() -> ServerMetadata {
        ServerMetadata::new(
            "HelloWorldAPI",
            env!("CARGO_PKG_VERSION"),
            "The simplest possible MCP service",
        )
        .with_author(env!("CARGO_PKG_AUTHORS"))
        .with_github(env!("CARGO_PKG_REPOSITORY"))
    }

    /// Startup parameters this module accepts.
    #[must_use]
    pub fn parameters() -> Vec<ModuleParameter> {
        vec![ModuleParameter::new("greeting", ParamKind::Str, "the greeting to use")
            .with_default(DEFAULT_GREETING)]
    }

    /// The configured greeting.
    #[must_use]
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Renders `hello_prompt` without a module instance.
    #[must_use]
    pub fn render_prompt(arguments: &HashMap<String, String>) -> PromptContent {
        let name = arguments
            .get("name")
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NAME);
        PromptContent {
            description: Some("Greets someone by name".to_string()),
            messages: vec![PromptMessage::text(Role::User, format!("Hello, {name}!"))],
        }
    }

    /// The prompt templates, without a module instance.
    #[must_use]
    pub fn templates() -> Vec<PromptTemplate> {
        vec![PromptTemplate {
            name: "hello_prompt".to_string(),
            description: Some("Greets someone by name".to_string()),
            arguments: vec![PromptArgument {
                name: "name".to_string(),
                description: Some("who to greet".to_string()),
                required: false,
                default: Some(DEFAULT_NAME.to_string()),
            }],
        }]
    }
}

impl Default for HelloWorldModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleCapability for HelloWorldModule {
    async fn initialize(&mut self, params: &ModuleParams) -> Result<(), ModuleError> {
        if let Some(greeting) = params.get_str("greeting").filter(|g| !g.is_empty()) {
            self.greeting = greeting.to_string();
        }
        tracing::info!(greeting = %self.greeting, "HelloWorld module initialised");
        Ok(())
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "hello",
            "Returns a greeting",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "your name"}
                },
                "required": ["name"]
            }),
        )]
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        ctx: &ToolContext<'_>,
    ) -> Result<Value, ModuleError> {
        match name {
            "hello" => {
                let who = arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ModuleError::InvalidArguments("name must be a string".to_string()))?;
                ctx.info(&format!("Greeting {who}")).await;
                Ok(json!({ "message": format!("{}, {who}!", self.greeting) }))
            }
            other => Err(ModuleError::UnknownTool(other.to_string())),
        }
    }

    fn prompt_templates(&self) -> Result<Vec<PromptTemplate>, ModuleError> {
        Ok(Self::templates())
    }

    fn prompt_content(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<PromptContent, ModuleError> {
        if name == "hello_prompt" {
            Ok(Self::render_prompt(arguments))
        } else {
            Err(ModuleError::PromptNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::context::RequestContext;
    use crate::mcp::protocol::RequestId;

    #[tokio::test]
    async fn greets_with_configured_greeting() {
        let mut module = HelloWorldModule::new();
        let params: ModuleParams = [("greeting".to_string(), json!("Howdy"))].into_iter().collect();
        module.initialize(&params).await.unwrap();
        assert_eq!(module.greeting(), "Howdy");

        let ctx = RequestContext::new(RequestId::Number(1), None, None);
        let mut args = Map::new();
        args.insert("name".to_string(), json!("Ada"));
        let out = module
            .call_tool("hello", &args, &ToolContext::new(&ctx))
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "Howdy, Ada!"}));
    }

    #[tokio::test]
    async fn non_string_name_rejected() {
        let module = HelloWorldModule::new();
        let ctx = RequestContext::new(RequestId::Number(1), None, None);
        let mut args = Map::new();
        args.insert("name".to_string(), json!(42));
        let err = module
            .call_tool("hello", &args, &ToolContext::new(&ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidArguments(_)));
    }

    #[test]
    fn unknown_prompt() {
        let module = HelloWorldModule::new();
        let err = module
            .prompt_content("goodbye", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ModuleError::PromptNotFound(_)));
    }

    #[test]
    fn prompt_defaults_name() {
        let content = HelloWorldModule::render_prompt(&HashMap::new());
        assert_eq!(content.messages.len(), 1);
        let json = serde_json::to_value(&content.messages[0]).unwrap();
        assert_eq!(json["content"]["text"], "Hello, World!");
    }
}
