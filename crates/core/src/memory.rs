//! Long-term memory records and the persistence trait.
//!
//! Three layers:
//! - **Episodic**: one record per completed task.
//! - **Semantic**: generalized rules abstracted from several episodes.
//! - **Procedural**: reusable tool-call strategies with a priority score.
//!
//! Records are append-mostly. Only scalar fields (importance, reward,
//! confidence, priority, usage counters) change after creation.

use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tool invocation inside an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool: String,
    pub success: bool,
}

/// Record of one concrete past task and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// What the user asked for
    pub task: String,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    /// Short description of the outcome
    pub result_summary: String,
    pub success: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub reward: f32,
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl EpisodicRecord {
    pub fn new(task: impl Into<String>, result_summary: impl Into<String>, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: String::new(),
            timestamp: Utc::now(),
            task: task.into(),
            actions: Vec::new(),
            result_summary: result_summary.into(),
            success,
            error_count: 0,
            retry_count: 0,
            reward: 0.0,
            importance: 1.0,
            tags: Vec::new(),
            embedding: Vec::new(),
        }
    }

    /// Tool names in call order.
    pub fn tool_sequence(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.tool.as_str()).collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A generalized statement derived from several episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticRule {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rule: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub source_episodes: Vec<String>,
    pub confidence: f32,
    #[serde(default)]
    pub activation_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

fn default_category() -> String {
    "general".into()
}

impl SemanticRule {
    pub fn new(rule: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            rule: rule.into(),
            category: category.into(),
            source_episodes: Vec::new(),
            confidence: 0.5,
            activation_count: 0,
            embedding: Vec::new(),
        }
    }
}

/// A reusable tool-call template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduralStrategy {
    pub id: String,
    /// Unique, human-readable name
    pub name: String,
    pub description: String,
    /// Ordered tool-call template
    #[serde(default)]
    pub steps: Vec<String>,
    /// In `[0, 1]`
    pub priority: f32,
    #[serde(default)]
    pub success_rate: f32,
    #[serde(default)]
    pub usage_count: u32,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl ProceduralStrategy {
    pub fn new(name: impl Into<String>, description: impl Into<String>, priority: f32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            priority: priority.clamp(0.0, 1.0),
            success_rate: 0.0,
            usage_count: 0,
            last_used: Utc::now(),
            conditions: Vec::new(),
            embedding: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<String>) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Common view used by similarity ranking.
pub trait MemoryItem {
    fn id(&self) -> &str;
    fn embedding(&self) -> &[f32];
    /// Timestamp used to break similarity ties (newer first).
    fn recency(&self) -> DateTime<Utc>;
}

impl MemoryItem for EpisodicRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
    fn recency(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl MemoryItem for SemanticRule {
    fn id(&self) -> &str {
        &self.id
    }
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
    fn recency(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl MemoryItem for ProceduralStrategy {
    fn id(&self) -> &str {
        &self.id
    }
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
    fn recency(&self) -> DateTime<Utc> {
        self.last_used
    }
}

/// A record paired with its ranking score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scored<T> {
    pub score: f32,
    pub item: T,
}

/// Per-layer retrieval result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalSet {
    pub episodes: Vec<Scored<EpisodicRecord>>,
    pub rules: Vec<Scored<SemanticRule>>,
    pub strategies: Vec<Scored<ProceduralStrategy>>,
}

impl RetrievalSet {
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty() && self.rules.is_empty() && self.strategies.is_empty()
    }
}

/// Which collection a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayer {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryLayer::Episodic => "episodic",
            MemoryLayer::Semantic => "semantic",
            MemoryLayer::Procedural => "procedural",
        }
    }
}

/// Any persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum MemoryRecord {
    Episode(EpisodicRecord),
    Rule(SemanticRule),
    Strategy(ProceduralStrategy),
}

impl MemoryRecord {
    pub fn layer(&self) -> MemoryLayer {
        match self {
            MemoryRecord::Episode(_) => MemoryLayer::Episodic,
            MemoryRecord::Rule(_) => MemoryLayer::Semantic,
            MemoryRecord::Strategy(_) => MemoryLayer::Procedural,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MemoryRecord::Episode(r) => &r.id,
            MemoryRecord::Rule(r) => &r.id,
            MemoryRecord::Strategy(r) => &r.id,
        }
    }
}

/// Everything a backend holds, as loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StoredMemory {
    pub episodes: Vec<EpisodicRecord>,
    pub rules: Vec<SemanticRule>,
    pub strategies: Vec<ProceduralStrategy>,
}

/// Durable storage behind the in-process memory store.
///
/// Implementations: SQLite, in-memory (for testing and ephemeral runs).
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Load every record.
    async fn load(&self) -> std::result::Result<StoredMemory, MemoryError>;

    /// Insert or replace a record by id.
    async fn persist(&self, record: &MemoryRecord) -> std::result::Result<(), MemoryError>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, layer: MemoryLayer, id: &str) -> std::result::Result<bool, MemoryError>;
}
