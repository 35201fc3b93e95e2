//! The pluggable module contract.
//!
//! A host crate implements [`ModuleCapability`] once; the framework builds a
//! single instance after configuration is resolved and shares it between
//! every protocol session for the lifetime of the process. Modules that
//! mutate their catalog therefore keep their state behind interior
//! mutability and announce changes through the listeners registered with
//! [`ModuleCapability::subscribe_to_changes`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::ModuleParams;
use crate::error::ModuleError;
use crate::mcp::context::ToolContext;
use crate::mcp::types::{PromptContent, PromptTemplate, Tool};

/// Callback fired by a module whenever its catalog changes.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Capability set a tool module exposes to the framework.
#[async_trait]
pub trait ModuleCapability: Send + Sync {
    /// One-time asynchronous setup, awaited before any session is served.
    ///
    /// # Errors
    ///
    /// Any error aborts startup.
    async fn initialize(&mut self, params: &ModuleParams) -> Result<(), ModuleError>;

    /// The current tool catalog.
    fn tools(&self) -> Vec<Tool>;

    /// Invokes a tool. The returned value is serialised to JSON text for the
    /// caller.
    ///
    /// # Errors
    ///
    /// Errors are reported to the caller in-band as `"Error: <message>"`.
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        ctx: &ToolContext<'_>,
    ) -> Result<Value, ModuleError>;

    /// The prompt templates this module offers. None by default.
    ///
    /// # Errors
    ///
    /// Errors are logged and replaced by an empty list.
    fn prompt_templates(&self) -> Result<Vec<PromptTemplate>, ModuleError> {
        Ok(Vec::new())
    }

    /// Renders a prompt template.
    ///
    /// # Errors
    ///
    /// The default reports every name as [`ModuleError::PromptNotFound`].
    fn prompt_content(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<PromptContent, ModuleError> {
        let _ = arguments;
        Err(ModuleError::PromptNotFound(name.to_string()))
    }

    /// Registers a callback to be fired when the catalog changes.
    ///
    /// Modules with a fixed catalog can ignore this.
    fn subscribe_to_changes(&self, listener: ChangeListener) {
        let _ = listener;
    }
}

/// A list of change listeners a module can embed.
#[derive(Default)]
pub struct ChangeListeners {
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ChangeListeners {
    /// Creates an empty listener list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn add(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Fires every registered listener.
    pub fn notify(&self) {
        // Snapshot so a listener may subscribe without deadlocking.
        let snapshot: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            listener();
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ChangeListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListeners")
            .field("len", &self.len())
            .finish()
    }
}

/// External replacement for a module's prompt listing.
pub type PromptListFn =
    Arc<dyn Fn() -> Result<Vec<PromptTemplate>, ModuleError> + Send + Sync>;

/// External replacement for a module's prompt rendering.
pub type PromptRenderFn = Arc<
    dyn Fn(&str, &HashMap<String, String>) -> Result<PromptContent, ModuleError> + Send + Sync,
>;

/// Optional prompt handlers that take precedence over the module's own.
#[derive(Clone, Default)]
pub struct PromptOverrides {
    list: Option<PromptListFn>,
    render: Option<PromptRenderFn>,
}

impl PromptOverrides {
    /// No overrides.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Replaces prompt listing.
    #[must_use]
    pub fn with_list<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Vec<PromptTemplate>, ModuleError> + Send + Sync + 'static,
    {
        self.list = Some(Arc::new(f));
        self
    }

    /// Replaces prompt rendering.
    #[must_use]
    pub fn with_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &HashMap<String, String>) -> Result<PromptContent, ModuleError>
            + Send
            + Sync
            + 'static,
    {
        self.render = Some(Arc::new(f));
        self
    }

    /// The listing override, if any.
    #[must_use]
    pub fn list(&self) -> Option<&PromptListFn> {
        self.list.as_ref()
    }

    /// The rendering override, if any.
    #[must_use]
    pub fn render(&self) -> Option<&PromptRenderFn> {
        self.render.as_ref()
    }
}

impl std::fmt::Debug for PromptOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptOverrides")
            .field("list", &self.list.is_some())
            .field("render", &self.render.is_some())
            .finish()
    }
}
