//! Model provider implementations for toolweave.
//!
//! All providers implement the `toolweave_core::Provider` trait and stream
//! normalized deltas. The router selects the correct provider based on
//! configuration and wraps it with transient-failure retry.

pub mod anthropic;
pub mod openai_compat;
pub mod retry;
pub mod router;
mod sse;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryingProvider;
pub use router::{build_from_config, ProviderRouter};
