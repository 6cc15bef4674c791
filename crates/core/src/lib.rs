//! # HelloAgents Core
//!
//! Domain types, traits, and error definitions for the HelloAgents ReAct runtime.
//! This crate has no async runtime dependency: it defines the model that the
//! tool, agent and context crates implement against.
//!
//! ## Layout
//!
//! - [`tool`]: declarative parameter schemas, the [`Tool`] trait and the
//!   [`ToolRegistry`] that turns free-form action input into typed params.
//! - [`args`]: the payload parsing and schema-driven coercion used by the registry.
//! - [`llm`]: the narrow [`LlmClient`] interface the loop talks to.
//! - [`memory`]: read/write interfaces for memory and retrieval collaborators.

pub mod args;
pub mod error;
pub mod llm;
pub mod memory;
pub mod message;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, LlmError, MemoryError, Result, ToolError};
pub use llm::{CHARS_PER_TOKEN, InvokeOptions, LlmClient};
pub use memory::{KnowledgeChunk, MemoryBackend, MemoryEntry, MemoryQuery, Retriever};
pub use message::{Message, Role};
pub use tool::{
    FunctionTool, ParamType, Tool, ToolInvocation, ToolParameter, ToolParams, ToolRegistry,
    ToolSchema,
};
