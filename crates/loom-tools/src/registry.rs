//! Tool registry and trait definitions (spec C1: Tool Contract).
//!
//! Each tool is a self-contained module implementing the `Tool` trait. Tools
//! can be added/removed by editing the `tools/` directory and the
//! `create_default_registry()` function in `lib.rs`.

use loom_core::types::ToolResult;
use loom_llm::LlmTool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a tool call needs beyond its arguments: the originating
/// session, a cancellation signal, and an optional deadline. Per spec §4.1,
/// a tool MUST NOT retain `ctx` past the call.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Implement this to add a new capability. Each tool is a standalone unit
/// registered with a `ToolRegistry`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "bash", "read", "glob"). Globally unique:
    /// re-registering the same name replaces the prior binding.
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// System prompt fragment for this tool (injected into LLM context).
    fn prompt(&self) -> &str {
        ""
    }

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether this tool is currently enabled.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Execute the tool with the given arguments. Implementations that wrap
    /// a blocking or long-running operation MUST observe `ctx.cancel`
    /// between suspension points.
    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolResult;

    /// Convert to the LLM tool definition format.
    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name,
    /// logging a warning when it does (spec §4.1).
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "duplicate tool registration, replacing prior binding");
        }
        self.tools.insert(name, Arc::new(tool));
    }

    /// Remove a tool by name.
    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => tool.execute(args, ctx).await,
            Some(_) => ToolResult::fail(format!("tool '{name}' is disabled")),
            None => ToolResult::fail(format!("tool not found: {name}")),
        }
    }

    /// Get LLM tool definitions for all enabled tools.
    pub fn get_definitions(&self) -> Vec<LlmTool> {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .map(|t| t.to_llm_tool())
            .collect()
    }

    /// Get system prompt fragments from all enabled tools.
    pub fn combined_prompts(&self) -> String {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// List only read-only tools.
    pub fn list_read_only(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|(_, t)| t.is_read_only())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(args.to_string())
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("s1", CancellationToken::new())
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", serde_json::json!({}), &ctx()).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(EchoTool);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn disabled_tool_fails_without_executing() {
        struct Disabled;
        #[async_trait::async_trait]
        impl Tool for Disabled {
            fn name(&self) -> &str {
                "disabled"
            }
            fn description(&self) -> &str {
                "never runs"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            fn is_enabled(&self) -> bool {
                false
            }
            async fn execute(&self, _: serde_json::Value, _: &ToolContext) -> ToolResult {
                ToolResult::ok("should not happen")
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(Disabled);
        let result = registry.execute("disabled", serde_json::json!({}), &ctx()).await;
        assert!(!result.success);
    }
}
