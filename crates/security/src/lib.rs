//! Security policies for HelloAgents tools.
//!
//! Provides:
//! - **Path sandbox**: resolve arguments against the workspace root, following symlinks
//! - **Command policy**: allowed heads, shell segment splitting, dangerous-feature detection,
//!   including side-effecting options of allowed heads

pub mod command;
pub mod path;

pub use command::{
    DangerousFeature, PolicyViolation, argv_features, check_git, check_segments,
    dangerous_features, is_allowed, is_dangerous, split_segments, words,
};
pub use path::{Sandbox, SandboxError, resolve_lenient};
