//! Context window management: token estimation, tool-output summaries and
//! the budget manager that compacts history before each provider call.

pub mod budget;
pub mod summary;
pub mod token;

pub use budget::{BudgetSettings, CompactionReport, CompactionStep, TokenBudgetManager};
pub use summary::summarize_tool_output;
pub use token::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens, estimate_tools_tokens};
