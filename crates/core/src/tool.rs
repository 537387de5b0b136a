//! Tool trait and capability table.
//!
//! Tools are how the agent acts on the outside world. Each one declares an
//! argument schema and an [`Affinity`]; the [`ToolRegistry`] validates both at
//! registration so dispatch never has to second-guess a definition.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use crate::schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a tool touches the shared external workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affinity {
    /// Serialized process-wide through a single worker.
    Exclusive,
    /// Runs on the bounded worker pool.
    Concurrent,
}

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// What a handler returns on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text shown to the model
    pub content: String,

    /// Short description of what changed, for dedup bookkeeping and UI display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_side_effects(mut self, summary: impl Into<String>) -> Self {
        self.side_effects = Some(summary.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The result of a tool execution, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// Payload on success, error description on failure
    pub output: String,

    /// `ToolError::kind()` of the final failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.content,
            error_kind: None,
            side_effects: output.side_effects,
            data: output.data,
        }
    }

    pub fn error(call_id: impl Into<String>, error: &ToolError) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: format!("Error: {error}"),
            error_kind: Some(error.kind().to_string()),
            side_effects: None,
            data: None,
        }
    }

    /// The same result re-addressed to another call id.
    pub fn for_call(&self, call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ..self.clone()
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "workspace_set").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Concurrency affinity. Tools that touch the shared workspace are exclusive.
    fn affinity(&self) -> Affinity {
        Affinity::Concurrent
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// One validated capability-table entry.
#[derive(Clone)]
pub struct RegisteredTool {
    pub handler: Arc<dyn Tool>,
    pub schema: serde_json::Value,
    pub affinity: Affinity,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Check call arguments against the registered schema.
    pub fn check_arguments(&self, arguments: &serde_json::Value) -> Result<(), ToolError> {
        schema::validate_arguments(&self.schema, arguments).map_err(|reason| {
            ToolError::InvalidArguments(format!("{}: {reason}", self.name()))
        })
    }
}

/// Capability table mapping tool names to schema, affinity and handler.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, validating its name and schema up front.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(ToolError::InvalidSchema {
                tool_name: name,
                reason: "tool name must not be empty".into(),
            });
        }
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }

        let schema = tool.parameters_schema();
        schema::validate_schema(&schema).map_err(|reason| ToolError::InvalidSchema {
            tool_name: name.clone(),
            reason,
        })?;

        let affinity = tool.affinity();
        tracing::debug!(tool = %name, ?affinity, "Registered tool");
        self.tools.insert(
            name,
            RegisteredTool {
                handler: tool,
                schema,
                affinity,
            },
        );
        Ok(())
    }

    /// Get a tool entry by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.handler.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(arguments["text"].as_str().unwrap_or("")))
        }
    }

    struct BrokenSchemaTool;

    #[async_trait]
    impl Tool for BrokenSchemaTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Declares a required key it never defines"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {}, "required": ["x"] })
        }
        fn affinity(&self) -> Affinity {
            Affinity::Exclusive
        }
        async fn execute(
            &self,
            _arguments: serde_json::Value,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Ok(ToolOutput::default())
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let entry = registry.get("echo").unwrap();
        assert_eq!(entry.affinity, Affinity::Concurrent);
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool(_)));
    }

    #[test]
    fn registry_rejects_invalid_schema_at_registration() {
        let mut registry = ToolRegistry::new();
        let err = registry.register(Arc::new(BrokenSchemaTool)).unwrap_err();
        assert!(matches!(err, ToolError::InvalidSchema { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[test]
    fn argument_check_uses_registered_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let entry = registry.get("echo").unwrap();
        assert!(entry.check_arguments(&serde_json::json!({"text": "hi"})).is_ok());
        let err = entry.check_arguments(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[test]
    fn error_results_carry_kind() {
        let err = ToolError::NotFound("ghost".into());
        let result = ToolResult::error("call_1", &err);
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("not_found"));
        assert!(result.output.contains("ghost"));
        assert_eq!(result.for_call("call_2").call_id, "call_2");
    }
}
