//! Built-in tool implementations for HelloAgents.
//!
//! - [`terminal`]: whitelisted command execution confined to a workspace
//! - [`context_fetch`]: on-demand memory, file and knowledge lookups
//! - [`apply_patch`]: backed-up file edits, registered when
//!   `enable_apply_patch` is set

pub mod apply_patch;
pub mod context_fetch;
pub mod terminal;

use helloagents_config::TerminalConfig;
use helloagents_core::error::ToolError;
use helloagents_core::memory::{MemoryBackend, Retriever};
use helloagents_core::tool::ToolRegistry;
use std::sync::Arc;

pub use apply_patch::{ApplyPatchTool, PatchError, PatchReport};
pub use context_fetch::ContextFetchTool;
pub use terminal::{ConfirmFn, TerminalTool};

/// Create a registry with the terminal and context-fetch tools rooted at
/// `config.workspace`, plus `apply_patch` when the config enables it.
pub fn default_registry(
    config: &TerminalConfig,
    memory: Option<Arc<dyn MemoryBackend>>,
    knowledge: Option<Arc<dyn Retriever>>,
) -> Result<ToolRegistry, ToolError> {
    let terminal = TerminalTool::new(config)?;

    let mut fetch = ContextFetchTool::new(terminal.workspace());
    if let Some(memory) = memory {
        fetch = fetch.with_memory(memory);
    }
    if let Some(knowledge) = knowledge {
        fetch = fetch.with_knowledge(knowledge);
    }

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(terminal));
    registry.register(Box::new(fetch));
    if config.enable_apply_patch {
        registry.register(Box::new(ApplyPatchTool::new(config)?));
    }
    Ok(registry)
}
