//! Concrete tool implementations and the registry that binds them to the tool worker.
//!
//! Not part of the C1-C4 core itself, but kept in this crate so the orchestrator and
//! worker coordinator have something real to dispatch to in tests and in the `ark`
//! binary.

pub mod bash;
pub mod editor_edit;

use crate::message::{Tool, ToolCall};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

pub use bash::BashTool;
pub use editor_edit::EditorEditTool;

/// Uniform interface the tool worker dispatches through. `execute` returns the tool's
/// raw output string on success, or a human-readable error string on failure — the
/// worker coordinator wraps either into a `ToolResult`/error tool message.
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn brief(&self) -> &str;
    /// Full usage description sent to the LLM as the tool schema's `description`.
    /// Defaults to `brief()` for tools that don't need a longer writeup.
    fn full_description(&self) -> String {
        self.brief().to_string()
    }
    fn parameters(&self) -> serde_json::Value;
    fn execute<'a>(&'a self, call: &'a ToolCall) -> BoxFuture<'a, Result<String, String>>;
}

/// The tool set the `ark` binary and the core's own tests dispatch against.
pub fn all_tools() -> Vec<Arc<dyn ToolProvider>> {
    vec![Arc::new(BashTool::new()), Arc::new(EditorEditTool::new())]
}

/// Binds tool names to providers and executes `ToolCall`s against them. Owned by the
/// tool worker (C4); the orchestrator never touches it directly.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register<T: ToolProvider + 'static>(mut self, tool: T) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn register_all_builtin(mut self) -> Self {
        for tool in all_tools() {
            self.tools.insert(tool.name().to_string(), tool);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool schemas to attach to the wire request's `tools` array.
    pub fn get_tools_for_llm(&self) -> Vec<Tool> {
        self.tools
            .values()
            .map(|provider| Tool {
                name: provider.name().to_string(),
                description: provider.full_description(),
                parameters: provider.parameters(),
            })
            .collect()
    }

    /// Dispatches one call. `Err` means the name is unregistered or the tool itself
    /// failed; the caller (the C4 tool worker) turns either into a `ToolResponse`.
    pub async fn execute(&self, call: &ToolCall) -> Result<String, String> {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => Err(format!("unknown tool: {}", call.name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_register_all_builtin_finds_bash() {
        let registry = ToolRegistry::new().register_all_builtin();
        assert!(registry.has_tool("bash"));
        assert!(registry.has_tool("editor__Edit"));
    }

    #[tokio::test]
    async fn registry_executes_bash() {
        let registry = ToolRegistry::new().register_all_builtin();
        let call = ToolCall {
            id: "t1".to_string(),
            kind: "function".to_string(),
            name: "bash".to_string(),
            arguments: r#"{"command":"echo hi"}"#.to_string(),
        };
        let result = registry.execute(&call).await.unwrap();
        assert!(result.contains("hi"));
    }

    #[tokio::test]
    async fn registry_reports_unknown_tool() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "t1".to_string(),
            kind: "function".to_string(),
            name: "nope".to_string(),
            arguments: "{}".to_string(),
        };
        assert!(registry.execute(&call).await.is_err());
    }
}
