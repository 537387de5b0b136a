//! Tool dispatch and built-in tools for toolweave.
//!
//! The [`ToolDispatchRouter`] executes calls against a validated
//! [`ToolRegistry`]: exclusive tools through one serializing worker,
//! concurrent tools on a bounded pool, with retries and timeouts.

pub mod dispatch;
pub mod memory_search;
pub mod shell;
pub mod workspace;

pub use dispatch::{DispatchSettings, Dispatched, ExclusiveWorker, ToolDispatchRouter};
pub use workspace::Workspace;

use std::sync::Arc;
use toolweave_config::DispatchConfig;
use toolweave_core::error::ToolError;
use toolweave_core::tool::ToolRegistry;
use toolweave_memory::MemoryStore;

/// Registry with every built-in tool.
///
/// The shell tool only runs commands on `config.allowed_commands`.
pub fn default_registry(
    config: &DispatchConfig,
    workspace: Arc<Workspace>,
    memory: Option<Arc<MemoryStore>>,
) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(shell::ShellTool::new(config.allowed_commands.clone())))?;
    registry.register(Arc::new(workspace::WorkspaceGetTool::new(workspace.clone())))?;
    registry.register(Arc::new(workspace::WorkspaceSetTool::new(workspace)))?;
    if let Some(store) = memory {
        registry.register(Arc::new(memory_search::MemorySearchTool::new(store)))?;
    }
    Ok(registry)
}
