//! The protocol server: one per process, shared by every session.
//!
//! [`ProtocolServer`] binds a [`ModuleCapability`] to the MCP operations
//! (list tools, call tool, list prompts, get prompt) and applies the error
//! policy for each:
//!
//! - tool failures are encoded in-band as `"Error: <message>"`
//! - prompt listing failures become an empty list
//! - prompt rendering failures propagate to the caller
//!
//! It also subscribes to the module's change notifications and forwards them
//! as `notifications/resources/list_changed` to the session whose tool call
//! triggered the change.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ModuleError;
use crate::mcp::context::{RequestContext, ToolContext};
use crate::mcp::module::{ModuleCapability, PromptOverrides};
use crate::mcp::session::SessionHandle;
use crate::mcp::types::{
    CallToolResult, InitializeResult, PromptContent, PromptTemplate, ServerCapabilities,
    ServerInfo, Tool,
};

tokio::task_local! {
    /// Session whose `tools/call` is currently being polled.
    static ACTIVE_SESSION: SessionHandle;
}

/// Binds a module to the MCP request surface.
pub struct ProtocolServer {
    info: ServerInfo,
    instructions: Option<String>,
    module: Arc<dyn ModuleCapability>,
    prompts: PromptOverrides,
}

impl ProtocolServer {
    /// Creates a server around an initialised module and subscribes to its
    /// change notifications.
    #[must_use]
    pub fn new(info: ServerInfo, module: Arc<dyn ModuleCapability>) -> Self {
        module.subscribe_to_changes(Arc::new(notify_active_session));
        Self {
            info,
            instructions: None,
            module,
            prompts: PromptOverrides::none(),
        }
    }

    /// Sets the instructions returned from `initialize`.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Installs external prompt handlers.
    #[must_use]
    pub fn with_prompt_overrides(mut self, prompts: PromptOverrides) -> Self {
        self.prompts = prompts;
        self
    }

    /// Server name and version.
    #[must_use]
    pub const fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Builds the `initialize` result for an already negotiated version.
    #[must_use]
    pub fn initialize_result(&self, protocol_version: &str) -> InitializeResult {
        InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: ServerCapabilities::default(),
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        }
    }

    /// The module's current tool catalog.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.module.tools()
    }

    /// Invokes a tool. Never fails at the protocol level.
    ///
    /// Missing or empty `arguments` are rejected before the module is called.
    /// On success the module's value is rendered as indented JSON text.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<&Map<String, Value>>,
        ctx: &RequestContext,
    ) -> CallToolResult {
        let Some(arguments) = arguments.filter(|a| !a.is_empty()) else {
            tracing::warn!(tool = name, "Tool call without arguments");
            return CallToolResult::error("Missing arguments");
        };

        tracing::info!(tool = name, id = %ctx.request_id(), "Calling tool");

        let tool_ctx = ToolContext::new(ctx);
        let call = self.module.call_tool(name, arguments, &tool_ctx);
        let outcome = match ctx.session() {
            Some(session) => ACTIVE_SESSION.scope(session.clone(), call).await,
            None => call.await,
        };

        match outcome.and_then(|value| serde_json::to_string_pretty(&value).map_err(ModuleError::from)) {
            Ok(text) => CallToolResult::text(text),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool call failed");
                CallToolResult::error(e)
            }
        }
    }

    /// Prompt templates from the override or the module. Failures yield an
    /// empty list.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptTemplate> {
        let listed = match self.prompts.list() {
            Some(list) => list(),
            None => self.module.prompt_templates(),
        };
        listed.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to list prompt templates");
            Vec::new()
        })
    }

    /// Renders a prompt from the override or the module.
    ///
    /// # Errors
    ///
    /// Returns the renderer's error unchanged.
    pub fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<PromptContent, ModuleError> {
        let rendered = match self.prompts.render() {
            Some(render) => render(name, arguments),
            None => self.module.prompt_content(name, arguments),
        };
        if let Err(e) = &rendered {
            tracing::warn!(prompt = name, error = %e, "Failed to render prompt");
        }
        rendered
    }
}

impl std::fmt::Debug for ProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServer")
            .field("info", &self.info)
            .field("prompts", &self.prompts)
            .finish_non_exhaustive()
    }
}

/// Change listener registered with the module.
///
/// Runs synchronously inside module code, so delivery is spawned onto the
/// runtime and its outcome logged.
fn notify_active_session() {
    let Ok(session) = ACTIVE_SESSION.try_with(SessionHandle::clone) else {
        tracing::debug!("Catalog changed outside a tool call; no session to notify");
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(session = %session.id(), "No runtime to deliver change notification");
        return;
    };
    runtime.spawn(async move {
        match session.send_resource_list_changed().await {
            Ok(()) => tracing::debug!(session = %session.id(), "Sent resource list change"),
            Err(e) => tracing::warn!(
                session = %session.id(),
                error = %e,
                "Failed to send resource list change"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleParams;
    use crate::mcp::protocol::RequestId;
    use crate::mcp::types::{PromptMessage, Role};
    use async_trait::async_trait;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl ModuleCapability for Failing {
        async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), ModuleError> {
            Ok(())
        }

        fn tools(&self) -> Vec<Tool> {
            Vec::new()
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: &Map<String, Value>,
            _ctx: &ToolContext<'_>,
        ) -> Result<Value, ModuleError> {
            Err(ModuleError::msg("kaputt"))
        }

        fn prompt_templates(&self) -> Result<Vec<PromptTemplate>, ModuleError> {
            Err(ModuleError::msg("no prompts today"))
        }
    }

    fn server() -> ProtocolServer {
        ProtocolServer::new(ServerInfo::new("t", "1"), Arc::new(Failing))
    }

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::Number(1), None, None)
    }

    #[tokio::test]
    async fn missing_arguments_is_in_band() {
        let result = server().call_tool("x", None, &ctx()).await;
        assert!(result.is_error);
        assert_eq!(result.first_text(), Some("Error: Missing arguments"));

        let empty = Map::new();
        let result = server().call_tool("x", Some(&empty), &ctx()).await;
        assert_eq!(result.first_text(), Some("Error: Missing arguments"));
    }

    #[tokio::test]
    async fn module_error_is_prefixed() {
        let mut args = Map::new();
        args.insert("a".to_string(), json!(1));
        let result = server().call_tool("x", Some(&args), &ctx()).await;
        assert_eq!(result.first_text(), Some("Error: kaputt"));
    }

    #[test]
    fn listing_failure_yields_empty() {
        assert!(server().list_prompts().is_empty());
    }

    #[test]
    fn default_prompt_content_is_not_found() {
        let err = server().get_prompt("nope", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ModuleError::PromptNotFound(ref n) if n == "nope"));
    }

    #[test]
    fn overrides_take_precedence() {
        let server = server().with_prompt_overrides(
            PromptOverrides::none()
                .with_list(|| {
                    Ok(vec![PromptTemplate {
                        name: "external".to_string(),
                        description: None,
                        arguments: Vec::new(),
                    }])
                })
                .with_render(|name, _| {
                    Ok(PromptContent {
                        description: None,
                        messages: vec![PromptMessage::text(Role::User, name)],
                    })
                }),
        );
        assert_eq!(server.list_prompts()[0].name, "external");
        let content = server.get_prompt("abc", &HashMap::new()).unwrap();
        assert_eq!(content.messages[0], PromptMessage::text(Role::User, "abc"));
    }

    #[test]
    fn initialize_result_carries_instructions() {
        let result = server()
            .with_instructions("Be nice")
            .initialize_result("2025-03-26");
        assert_eq!(result.protocol_version, "2025-03-26");
        assert_eq!(result.instructions.as_deref(), Some("Be nice"));
        assert_eq!(result.server_info.name, "t");
    }

    #[test]
    fn change_outside_tool_call_is_dropped() {
        notify_active_session();
    }
}
