//! Client-side tools the agent can invoke during a conversation.

use async_trait::async_trait;
use convai_types::Payload;
use futures_util::FutureExt;
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, warn};

/// Name of the system tool the agent calls to hang up.
pub const END_CALL_TOOL: &str = "end_call";

/// Outcome of a tool execution, sent back as a `client_tool_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    /// The result string, plain text or JSON.
    Success(String),
    /// An error message for the agent.
    Failure(String),
}

impl ToolResult {
    pub fn success(value: impl Into<String>) -> Self {
        Self::Success(value.into())
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The string sent to the agent, whichever the outcome.
    pub fn value(&self) -> &str {
        match self {
            Self::Success(value) | Self::Failure(value) => value,
        }
    }
}

/// A capability the agent can run on the client.
///
/// Returning `Ok(None)` means no response should be sent, which is distinct
/// from a failure. Errors are reported to the agent as failures.
#[async_trait]
pub trait ClientTool: Send + Sync {
    async fn execute(&self, parameters: &Payload) -> anyhow::Result<Option<ToolResult>>;
}

/// Adapts an async closure into a [`ClientTool`].
pub struct FnTool<F>(F);

impl<F> FnTool<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ClientTool for FnTool<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<ToolResult>>> + Send + 'static,
{
    async fn execute(&self, parameters: &Payload) -> anyhow::Result<Option<ToolResult>> {
        (self.0)(parameters.clone()).await
    }
}

/// Thread-safe name → tool mapping shared between the application and the
/// session. Cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn ClientTool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, tool: Arc<dyn ClientTool>) {
        let name = name.into();
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool)
            .is_some();
        debug!(tool = %name, replaced, "Registered client tool");
    }

    /// Registers an async closure as a tool.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ToolResult>>> + Send + 'static,
    {
        self.register(name, Arc::new(FnTool::new(f)));
    }

    /// Removes a tool. Executions already in flight keep their handle.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of all registered tools, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ClientTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Runs the named tool.
    ///
    /// Never fails: handler errors and panics are converted into
    /// [`ToolResult::Failure`]. `None` means the tool asked for no response.
    pub async fn execute(&self, name: &str, parameters: &Payload) -> Option<ToolResult> {
        let Some(tool) = self.get(name) else {
            return Some(ToolResult::failure(format!("Tool '{name}' not registered")));
        };

        match AssertUnwindSafe(tool.execute(parameters)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Client tool returned an error");
                Some(ToolResult::failure(format!("Tool execution failed: {e}")))
            }
            Err(panic) => {
                let reason = crate::callbacks::panic_message(panic.as_ref());
                warn!(tool = %name, %reason, "Client tool panicked");
                Some(ToolResult::failure(format!("Tool execution failed: {reason}")))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
