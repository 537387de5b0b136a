//! Provider trait: the abstraction over model backends.
//!
//! A provider turns a conversation into a stream of [`StreamDelta`]s. Each
//! adapter converts its wire format (field names, usage shapes, cache metrics)
//! into the normalized types here before anything reaches the engine.

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
            stop: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage, normalized across providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens, including cache hits and cache writes.
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Reasoning tokens (a subset of output on providers that report them).
    pub reasoning_tokens: u64,
    pub cache_hit_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cache_hit_tokens += other.cache_hit_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    /// Normalize a provider usage object.
    ///
    /// Understands OpenAI (`prompt_tokens`, `prompt_tokens_details.cached_tokens`,
    /// `completion_tokens_details.reasoning_tokens`), DeepSeek
    /// (`prompt_cache_hit_tokens`; a cache miss is not a write) and Anthropic
    /// (`input_tokens`, `cache_read_input_tokens`, `cache_creation_input_tokens`).
    /// Anthropic reports cache tokens outside `input_tokens`, so they are added in.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let field = |path: &[&str]| -> Option<u64> {
            let mut cur = value;
            for key in path {
                cur = cur.get(key)?;
            }
            cur.as_u64()
        };

        let cache_read = field(&["cache_read_input_tokens"]);
        let cache_creation = field(&["cache_creation_input_tokens"]);
        let anthropic_style =
            field(&["input_tokens"]).is_some() && field(&["prompt_tokens"]).is_none();

        let cache_hit_tokens = field(&["prompt_tokens_details", "cached_tokens"])
            .or(cache_read)
            .or(field(&["prompt_cache_hit_tokens"]))
            .unwrap_or(0);
        let cache_write_tokens = cache_creation.unwrap_or(0);

        let mut input_tokens = field(&["prompt_tokens"])
            .or(field(&["input_tokens"]))
            .unwrap_or(0);
        if anthropic_style {
            input_tokens += cache_read.unwrap_or(0) + cache_creation.unwrap_or(0);
        }

        Self {
            input_tokens,
            output_tokens: field(&["completion_tokens"])
                .or(field(&["output_tokens"]))
                .unwrap_or(0),
            reasoning_tokens: field(&["completion_tokens_details", "reasoning_tokens"])
                .unwrap_or(0),
            cache_hit_tokens,
            cache_write_tokens,
        }
    }
}

/// A fragment of a streamed tool call. Fragments sharing an `index` belong
/// to the same call; `id` and `name` usually arrive only on the first one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// One event in a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    Thinking { text: String },
    Text { text: String },
    ToolCall(ToolCallDelta),
    Usage(Usage),
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

/// Receiving half of a streamed completion.
pub type DeltaStream = mpsc::Receiver<std::result::Result<StreamDelta, ProviderError>>;

/// A complete response assembled from a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The assistant message (text plus tool calls)
    pub message: Message,

    /// Reasoning text, when the model exposes it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,

    /// Normalized token usage
    pub usage: Usage,

    /// Which model was asked
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds stream deltas into a response, keeping arrival order of text and
/// the issue order (by index) of tool calls.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    thinking: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Usage,
    finish_reason: Option<String>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Thinking { text } => self.thinking.push_str(text),
            StreamDelta::Text { text } => self.text.push_str(text),
            StreamDelta::ToolCall(tc) => {
                let entry = self.calls.entry(tc.index).or_default();
                if let Some(id) = &tc.id {
                    if !id.is_empty() {
                        entry.id = id.clone();
                    }
                }
                if let Some(name) = &tc.name {
                    if !name.is_empty() {
                        entry.name = name.clone();
                    }
                }
                entry.arguments.push_str(&tc.arguments);
            }
            StreamDelta::Usage(u) => self.usage.add(u),
            StreamDelta::Done { finish_reason } => {
                self.done = true;
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason.clone();
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tool calls in index order. Ids may be empty when the provider omitted them.
    pub fn tool_calls(&self) -> Vec<MessageToolCall> {
        self.calls
            .values()
            .filter(|c| !c.name.is_empty())
            .map(|c| MessageToolCall {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect()
    }

    pub fn finish(self, model: impl Into<String>) -> ProviderResponse {
        let tool_calls = self.tool_calls();
        ProviderResponse {
            message: Message::assistant_with_tools(self.text, tool_calls),
            thinking: self.thinking,
            usage: self.usage,
            model: model.into(),
            finish_reason: self.finish_reason,
        }
    }
}

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// The model to use for embeddings (e.g., "text-embedding-3-small").
    pub model: String,

    /// The texts to embed.
    pub inputs: Vec<String>,
}

/// An embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The embedding vectors, one per input text.
    pub embeddings: Vec<Vec<f32>>,

    /// Which model was used.
    pub model: String,
}

/// The core Provider trait.
///
/// Every model backend implements `stream_completion`. The engine consumes
/// the returned channel with plain `recv().await`; nothing is callback driven.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "anthropic").
    fn name(&self) -> &str;

    /// Start a streamed completion.
    async fn stream_completion(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<DeltaStream, ProviderError>;

    /// Run a completion to the end and return the assembled response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        let mut rx = self.stream_completion(request).await?;
        let mut acc = StreamAccumulator::new();
        while let Some(delta) = rx.recv().await {
            let delta = delta?;
            acc.push(&delta);
            if acc.is_done() {
                break;
            }
        }
        Ok(acc.finish(model))
    }

    /// Generate embeddings for the given texts.
    ///
    /// Default implementation returns an error indicating embeddings aren't supported.
    async fn embed(
        &self,
        _request: EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support embeddings",
            self.name()
        )))
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}
