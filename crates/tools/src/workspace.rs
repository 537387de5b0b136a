//! The shared workspace and the exclusive tools that touch it.
//!
//! [`Workspace`] is an in-process key/value scene. Its tools declare
//! [`Affinity::Exclusive`], so every read and write goes through the single
//! exclusive worker, whichever session issued it.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use toolweave_core::error::ToolError;
use toolweave_core::tool::{Affinity, Tool, ToolOutput};

/// Key/value state shared by all sessions.
#[derive(Debug, Default)]
pub struct Workspace {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl Workspace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store `value`, returning what was there before.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Read one workspace entry.
pub struct WorkspaceGetTool {
    workspace: Arc<Workspace>,
}

impl WorkspaceGetTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WorkspaceGetTool {
    fn name(&self) -> &str {
        "workspace_get"
    }

    fn description(&self) -> &str {
        "Read a value from the shared workspace. Omit 'key' to list every key."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Entry to read" }
            }
        })
    }

    fn affinity(&self) -> Affinity {
        Affinity::Exclusive
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let Some(key) = arguments.get("key").and_then(Value::as_str) else {
            let keys = self.workspace.keys();
            let text = if keys.is_empty() {
                "The workspace is empty.".to_string()
            } else {
                keys.join("\n")
            };
            return Ok(ToolOutput::text(text).with_data(json!({ "keys": keys })));
        };

        match self.workspace.get(key) {
            Some(value) => Ok(ToolOutput::text(value.to_string()).with_data(value)),
            None => Err(ToolError::ExecutionFailed {
                tool_name: "workspace_get".into(),
                reason: format!("no entry named '{key}'"),
            }),
        }
    }
}

/// Write one workspace entry.
pub struct WorkspaceSetTool {
    workspace: Arc<Workspace>,
}

impl WorkspaceSetTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WorkspaceSetTool {
    fn name(&self) -> &str {
        "workspace_set"
    }

    fn description(&self) -> &str {
        "Create or overwrite a value in the shared workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Entry to write" },
                "value": { "description": "Any JSON value" }
            },
            "required": ["key", "value"]
        })
    }

    fn affinity(&self) -> Affinity {
        Affinity::Exclusive
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let key = arguments["key"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'key'".into()))?;
        let value = arguments["value"].clone();

        let effect = match self.workspace.set(key, value) {
            Some(_) => format!("updated '{key}'"),
            None => format!("created '{key}'"),
        };
        Ok(ToolOutput::text(format!("Workspace entry {effect}.")).with_side_effects(effect))
    }
}
