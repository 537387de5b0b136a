//! Memory search tool: lets the agent query its long-term memory on demand.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use toolweave_core::error::ToolError;
use toolweave_core::tool::{Tool, ToolOutput};
use toolweave_memory::MemoryStore;

const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 20;

/// Searches rules, strategies and past episodes by text.
pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
struct Hit {
    layer: &'static str,
    score: f32,
    text: String,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for learned rules, tool strategies and similar past tasks. \
         Use this before unfamiliar work to reuse what worked before."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum results per memory layer (default 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'query'".into()))?;
        let limit = arguments["limit"]
            .as_u64()
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT) as usize;

        let found = self.store.search_text(query, limit).await;
        let mut hits: Vec<Hit> = Vec::new();
        hits.extend(found.rules.iter().map(|s| Hit {
            layer: "rule",
            score: s.score,
            text: format!("{} (confidence {:.2})", s.item.rule, s.item.confidence),
        }));
        hits.extend(found.strategies.iter().map(|s| Hit {
            layer: "strategy",
            score: s.score,
            text: format!("{}: {} (priority {:.2})", s.item.name, s.item.description, s.item.priority),
        }));
        hits.extend(found.episodes.iter().map(|s| Hit {
            layer: "episode",
            score: s.score,
            text: format!("{} -> {}", s.item.task, s.item.result_summary),
        }));
        hits.retain(|h| h.score > 0.0);

        if hits.is_empty() {
            return Ok(ToolOutput::text(format!("No memories found matching '{query}'.")));
        }

        let text = hits
            .iter()
            .map(|h| format!("[{}] {:.2} {}", h.layer, h.score, h.text))
            .collect::<Vec<_>>()
            .join("\n");
        let data = serde_json::to_value(&hits).unwrap_or(Value::Null);
        Ok(ToolOutput::text(text).with_data(data))
    }
}
