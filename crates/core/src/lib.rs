//! # toolweave core
//!
//! Domain types, traits, and error definitions for the toolweave orchestration
//! engine. This crate has **zero framework dependencies**: it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is a trait here. Implementations live in their
//! respective crates, so tests can swap in scripted providers and tools and
//! the dependency graph points inward.

pub mod agent;
pub mod backoff;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod provider;
pub mod round;
pub mod schema;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::LoopState;
pub use backoff::Backoff;
pub use error::{Error, Result};
pub use event::{EngineEvent, EventBus};
pub use memory::{
    EpisodicRecord, MemoryBackend, MemoryLayer, MemoryRecord, ProceduralStrategy, RetrievalSet,
    SemanticRule,
};
pub use message::{ImageRef, Message, MessageToolCall, Role, SessionId};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamDelta, Usage};
pub use tool::{Affinity, Tool, ToolCall, ToolOutput, ToolRegistry, ToolResult};
