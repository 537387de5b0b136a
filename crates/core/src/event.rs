//! Engine event stream for presentation layers.
//!
//! The engine publishes what it is doing; whoever renders it subscribes.
//! Nothing in the core depends on whether anyone is listening.

use crate::agent::LoopState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A fragment of assistant text
    TokenDelta { session_id: String, text: String },

    /// A fragment of model reasoning
    ThinkingDelta { session_id: String, text: String },

    /// A tool dispatch began
    ToolStart {
        session_id: String,
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool dispatch finished (or was answered from the per-turn dedup cache)
    ToolEnd {
        session_id: String,
        call_id: String,
        tool_name: String,
        success: bool,
        deduplicated: bool,
        duration_ms: u64,
    },

    /// The loop moved between states
    StateChange {
        session_id: String,
        from: LoopState,
        to: LoopState,
        timestamp: DateTime<Utc>,
    },

    /// Context compaction ran
    BudgetCompacted {
        session_id: String,
        level: u8,
        tokens_before: usize,
        tokens_after: usize,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::TokenDelta { session_id, .. }
            | EngineEvent::ThinkingDelta { session_id, .. }
            | EngineEvent::ToolStart { session_id, .. }
            | EngineEvent::ToolEnd { session_id, .. }
            | EngineEvent::StateChange { session_id, .. }
            | EngineEvent::BudgetCompacted { session_id, .. } => session_id,
        }
    }
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub; slow subscribers
/// lag rather than block the engine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<EngineEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
