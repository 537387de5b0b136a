//! The agent loop, its context budget and the sessions that own it.
//!
//! The engine follows a **Plan → Act → Observe** cycle:
//!
//! 1. **Receive** a user request for a session
//! 2. **Build context** (system prompt + recalled experience + history),
//!    compacted to fit the token budget
//! 3. **Stream** the request to the configured provider
//! 4. **If tool calls**: deduplicate, dispatch, append results, loop back to step 2
//! 5. **If text response**: finish, score the outcome and reflect on it
//!
//! The loop continues until the model responds without tool calls, the
//! request is cancelled, or the iteration limit is reached.

pub mod calls;
pub mod context;
pub mod loop_runner;
pub mod session;

#[cfg(test)]
mod testing;

pub use context::{BudgetSettings, CompactionReport, CompactionStep, TokenBudgetManager};
pub use loop_runner::{AgentLoopEngine, HistorySummary, RunOutcome, RunRequest, CANCELLED_TOOL_OUTPUT};
pub use session::{SessionHandle, SessionInfo, SessionRegistry, SharedServices};
