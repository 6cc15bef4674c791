//! Workspace sandbox. Every path a tool touches must resolve inside the
//! workspace root.
//!
//! Resolution follows symlinks for the components that exist on disk and
//! applies `..` against the resolved prefix, so neither `../../etc` nor a
//! symlink pointing out of the tree can escape.

use std::path::{Component, Path, PathBuf};

/// Error returned when sandbox resolution fails.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Path '{path}' resolves outside the workspace ({resolved})")]
    OutsideWorkspace { path: String, resolved: PathBuf },

    #[error("Failed to resolve workspace root '{path}': {reason}")]
    InvalidRoot { path: PathBuf, reason: String },
}

/// A canonical workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// The root must exist; it is canonicalized once here.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| SandboxError::InvalidRoot {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether an already-resolved path lies inside the root.
    pub fn contains(&self, resolved: &Path) -> bool {
        resolved.starts_with(&self.root)
    }

    /// Resolve `arg` relative to `base` and require the result to stay inside.
    pub fn resolve(&self, base: &Path, arg: &str) -> Result<PathBuf, SandboxError> {
        let resolved = resolve_lenient(&base.join(arg));
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            tracing::warn!(path = %arg, resolved = %resolved.display(), "Sandbox refused path");
            Err(SandboxError::OutsideWorkspace {
                path: arg.to_string(),
                resolved,
            })
        }
    }
}

/// Resolve a path component by component: existing prefixes are
/// canonicalized (following symlinks), the rest is normalized lexically.
pub fn resolve_lenient(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
        }
    }
    resolved
}
