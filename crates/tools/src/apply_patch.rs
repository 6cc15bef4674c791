//! Apply-patch tool — edit workspace files with `*** Begin Patch` blocks.
//!
//! ```text
//! *** Begin Patch
//! *** Add File: docs/notes.md
//! +first line
//! *** Update File: src/lib.rs
//! @@
//!  fn keep() {}
//! -fn old() {}
//! +fn new() {}
//! *** Delete File: stale.txt
//! *** End Patch
//! ```
//!
//! Every operation is checked and every new file body computed before the
//! first write. Files that are updated or deleted are copied to
//! `.helloagents/backups/YYYYMMDD_HHMMSS/<path>.bak` beforehand.

use async_trait::async_trait;
use chrono::Local;
use helloagents_config::TerminalConfig;
use helloagents_core::error::ToolError;
use helloagents_core::tool::{ParamType, Tool, ToolParameter, ToolParams, ToolSchema};
use helloagents_security::{Sandbox, SandboxError};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::terminal::{CANCELLED, ConfirmFn};

/// Backup directory, relative to the workspace root.
pub const BACKUP_DIR: &str = ".helloagents/backups";

const STATE_DIR: &str = ".helloagents";
const MAX_FILES: usize = 10;
const MAX_CHANGED_LINES: usize = 800;

/// Suffixes a patch may write. Files without a suffix are writable too.
const WRITABLE_SUFFIXES: &[&str] = &[
    "rs", "toml", "md", "txt", "json", "yml", "yaml", "py", "js", "ts", "html", "htm", "css",
];

const BEGIN: &str = "*** Begin Patch";
const END: &str = "*** End Patch";
const END_OF_FILE: &str = "*** End of File";

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch must start with '*** Begin Patch'")]
    MissingBegin,

    #[error("patch must end with '*** End Patch'")]
    MissingEnd,

    #[error("unexpected patch line: {0}")]
    UnexpectedLine(String),

    #[error("patch contains no file operations")]
    Empty,

    #[error("file appears more than once in patch: {0}")]
    Duplicate(String),

    #[error("too many files in patch: {count} > {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("patch too large: {changed} changed lines > {max}")]
    TooLarge { changed: usize, max: usize },

    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),

    #[error(transparent)]
    Outside(#[from] SandboxError),

    #[error("refusing to modify symlink: {0}")]
    Symlink(String),

    #[error("refusing to write under .helloagents/: {0}")]
    StatePath(String),

    #[error("file suffix not writable: .{0}")]
    Suffix(String),

    #[error("add target already exists: {0}")]
    AlreadyExists(String),

    #[error("target missing: {0}")]
    Missing(String),

    #[error("{path}: hunk has no context or removed lines")]
    EmptyHunk { path: String },

    #[error("{path}: hunk context not found near '{hint}'; re-read the file and retry")]
    ContextNotFound { path: String, hint: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatchOp {
    Add { path: String, content: String },
    Update { path: String, body: Vec<String> },
    Delete { path: String },
}

impl PatchOp {
    fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Update { path, .. } | PatchOp::Delete { path } => {
                path
            }
        }
    }
}

/// What [`ApplyPatchTool::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Paths as written in the patch, in patch order.
    pub files_changed: Vec<String>,
    /// Absolute paths of the backups taken.
    pub backups: Vec<PathBuf>,
}

/// A checked operation: `content` is the new body, `None` deletes.
struct PlannedWrite {
    path: String,
    target: PathBuf,
    existed: bool,
    content: Option<String>,
}

/// Apply patches inside a bounded workspace.
pub struct ApplyPatchTool {
    schema: ToolSchema,
    sandbox: Sandbox,
    confirm_dangerous: bool,
    confirm: Option<ConfirmFn>,
}

impl ApplyPatchTool {
    pub fn new(config: &TerminalConfig) -> Result<Self, ToolError> {
        std::fs::create_dir_all(&config.workspace).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "apply_patch".into(),
            reason: format!("cannot create workspace {}: {e}", config.workspace.display()),
        })?;
        let sandbox = Sandbox::new(&config.workspace).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "apply_patch".into(),
            reason: e.to_string(),
        })?;
        info!(workspace = %sandbox.root().display(), "Apply-patch tool ready");

        Ok(Self {
            schema: patch_schema(),
            sandbox,
            confirm_dangerous: config.confirm_dangerous,
            confirm: None,
        })
    }

    /// Install the callback consulted when `confirm_dangerous` is on.
    pub fn with_confirm(mut self, confirm: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    pub fn workspace(&self) -> &Path {
        self.sandbox.root()
    }

    /// Check and apply `patch` without asking for confirmation.
    pub fn apply(&self, patch: &str) -> Result<PatchReport, PatchError> {
        let planned = self.plan(patch)?;
        self.commit(planned)
    }

    fn plan(&self, patch: &str) -> Result<Vec<PlannedWrite>, PatchError> {
        let ops = parse_patch(patch)?;

        let mut seen = HashSet::new();
        for op in &ops {
            if !seen.insert(op.path()) {
                return Err(PatchError::Duplicate(op.path().to_string()));
            }
        }
        if seen.len() > MAX_FILES {
            return Err(PatchError::TooManyFiles {
                count: seen.len(),
                max: MAX_FILES,
            });
        }
        let changed = changed_lines(&ops);
        if changed > MAX_CHANGED_LINES {
            return Err(PatchError::TooLarge {
                changed,
                max: MAX_CHANGED_LINES,
            });
        }

        let mut planned = Vec::with_capacity(ops.len());
        for op in ops {
            let target = self.target(op.path())?;
            let existed = target.exists();
            let content = match &op {
                PatchOp::Add { path, content } => {
                    if existed {
                        return Err(PatchError::AlreadyExists(path.clone()));
                    }
                    Some(content.clone())
                }
                PatchOp::Delete { path } => {
                    if !target.is_file() {
                        return Err(PatchError::Missing(path.clone()));
                    }
                    None
                }
                PatchOp::Update { path, body } => {
                    if !target.is_file() {
                        return Err(PatchError::Missing(path.clone()));
                    }
                    let original = std::fs::read_to_string(&target).map_err(io_error(path))?;
                    Some(apply_update(&original, body, path)?)
                }
            };
            planned.push(PlannedWrite {
                path: op.path().to_string(),
                target,
                existed,
                content,
            });
        }
        Ok(planned)
    }

    fn commit(&self, planned: Vec<PlannedWrite>) -> Result<PatchReport, PatchError> {
        let root = self.sandbox.root();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let backup_root = root.join(BACKUP_DIR).join(stamp);

        let mut report = PatchReport::default();
        for write in planned {
            if write.existed {
                let relative = write.target.strip_prefix(root).unwrap_or(&write.target);
                let backup = backup_root.join(format!("{}.bak", relative.display()));
                if let Some(parent) = backup.parent() {
                    std::fs::create_dir_all(parent).map_err(io_error(&write.path))?;
                }
                std::fs::copy(&write.target, &backup).map_err(io_error(&write.path))?;
                report.backups.push(backup);
            }
            match &write.content {
                Some(content) => write_atomic(&write.target, content).map_err(io_error(&write.path))?,
                None => std::fs::remove_file(&write.target).map_err(io_error(&write.path))?,
            }
            report.files_changed.push(write.path);
        }

        info!(files = ?report.files_changed, backups = report.backups.len(), "Patch applied");
        Ok(report)
    }

    /// Resolve a patch path to a writable file inside the workspace.
    fn target(&self, path: &str) -> Result<PathBuf, PatchError> {
        if path.is_empty() {
            return Err(PatchError::Missing(path.to_string()));
        }
        if path.starts_with('/') || path.starts_with('~') || Path::new(path).is_absolute() {
            return Err(PatchError::AbsolutePath(path.to_string()));
        }
        let root = self.sandbox.root();
        if std::fs::symlink_metadata(root.join(path)).is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(PatchError::Symlink(path.to_string()));
        }

        let target = self.sandbox.resolve(root, path)?;
        if target == root || target.starts_with(root.join(STATE_DIR)) {
            return Err(PatchError::StatePath(path.to_string()));
        }
        if let Some(suffix) = target.extension().map(|s| s.to_string_lossy())
            && !WRITABLE_SUFFIXES.contains(&&*suffix)
        {
            return Err(PatchError::Suffix(suffix.into_owned()));
        }
        Ok(target)
    }

    fn confirmed(&self, summary: &str) -> bool {
        if !self.confirm_dangerous {
            return true;
        }
        match &self.confirm {
            Some(confirm) => confirm(summary),
            None => {
                warn!(patch = %summary, "Patch needs confirmation but no prompt is installed");
                false
            }
        }
    }

    fn render(&self, report: &PatchReport) -> String {
        let mut out = format!(
            "✅ 补丁已应用（{} 个文件）: {}",
            report.files_changed.len(),
            report.files_changed.join(", ")
        );
        if !report.backups.is_empty() {
            let backups = report
                .backups
                .iter()
                .map(|b| b.strip_prefix(self.sandbox.root()).unwrap_or(b).display().to_string())
                .collect::<Vec<_>>();
            out.push_str(&format!("\n备份: {}", backups.join(", ")));
        }
        out
    }
}

fn io_error(path: &str) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
    move |source| PatchError::Io {
        path: path.to_string(),
        source,
    }
}

/// Write through a sibling temp file so readers never see half a file.
fn write_atomic(target: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{name}.patch-tmp"));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, target)
}

// ── Parsing ───────────────────────────────────────────────────────────────

/// Split a patch into file operations. Text around the begin/end markers
/// (code fences, chatter) is ignored.
fn parse_patch(text: &str) -> Result<Vec<PatchOp>, PatchError> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim() == BEGIN)
        .ok_or(PatchError::MissingBegin)?;
    let end = lines
        .iter()
        .rposition(|l| l.trim() == END)
        .filter(|&end| end > start)
        .ok_or(PatchError::MissingEnd)?;
    let body = &lines[start + 1..end];

    let ends_block = |line: &str| line.starts_with("*** ") && line.trim() != END_OF_FILE;
    let mut ops = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let line = body[i];
        i += 1;
        if let Some(path) = line.strip_prefix("*** Add File: ") {
            let mut content = String::new();
            while i < body.len() && !ends_block(body[i]) {
                if body[i].trim() != END_OF_FILE {
                    // The `+` prefix is often left out.
                    content.push_str(body[i].strip_prefix('+').unwrap_or(body[i]));
                    content.push('\n');
                }
                i += 1;
            }
            ops.push(PatchOp::Add {
                path: path.trim().to_string(),
                content,
            });
        } else if let Some(path) = line.strip_prefix("*** Delete File: ") {
            ops.push(PatchOp::Delete {
                path: path.trim().to_string(),
            });
        } else if let Some(path) = line.strip_prefix("*** Update File: ") {
            let mut hunk_body = Vec::new();
            while i < body.len() && !ends_block(body[i]) {
                if body[i].trim() != END_OF_FILE {
                    hunk_body.push(body[i].to_string());
                }
                i += 1;
            }
            ops.push(PatchOp::Update {
                path: path.trim().to_string(),
                body: hunk_body,
            });
        } else if !line.trim().is_empty() {
            return Err(PatchError::UnexpectedLine(line.to_string()));
        }
    }

    if ops.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(ops)
}

fn changed_lines(ops: &[PatchOp]) -> usize {
    ops.iter()
        .map(|op| match op {
            PatchOp::Add { content, .. } => content.lines().count(),
            PatchOp::Delete { .. } => 1,
            PatchOp::Update { body, .. } => {
                body.iter().filter(|l| l.starts_with(['+', '-'])).count()
            }
        })
        .sum()
}

// ── Hunks ─────────────────────────────────────────────────────────────────

/// New body of a file after an update. A body without any diff markers
/// replaces the whole file.
fn apply_update(original: &str, body: &[String], path: &str) -> Result<String, PatchError> {
    if !body.is_empty() && body.iter().all(|l| !l.starts_with(['+', '-', ' '])) {
        let mut out = body.join("\n");
        out.push('\n');
        return Ok(out);
    }

    let mut current: Vec<String> = original.lines().map(str::to_string).collect();
    for hunk in split_hunks(body) {
        current = apply_hunk(&current, &hunk, path)?;
    }

    let mut out = current.join("\n");
    if !current.is_empty() && (original.is_empty() || original.ends_with('\n')) {
        out.push('\n');
    }
    Ok(out)
}

/// Hunks are separated by `@@` lines or empty lines. A blank context line
/// is a single space, so it does not split.
fn split_hunks(body: &[String]) -> Vec<Vec<&str>> {
    let mut hunks = Vec::new();
    let mut current = Vec::new();
    for line in body {
        if line.starts_with("@@") || line.is_empty() {
            if !current.is_empty() {
                hunks.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(line.as_str());
    }
    if !current.is_empty() {
        hunks.push(current);
    }
    hunks
        .into_iter()
        .filter(|h| h.iter().any(|l| l.starts_with([' ', '+', '-'])))
        .collect()
}

fn apply_hunk(current: &[String], hunk: &[&str], path: &str) -> Result<Vec<String>, PatchError> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    for line in hunk {
        let mut chars = line.chars();
        match chars.next() {
            Some(' ') => {
                before.push(chars.as_str());
                after.push(chars.as_str());
            }
            Some('-') => before.push(chars.as_str()),
            Some('+') => after.push(chars.as_str()),
            _ => {}
        }
    }
    if before.is_empty() {
        return Err(PatchError::EmptyHunk {
            path: path.to_string(),
        });
    }

    let Some(at) = find_block(current, &before) else {
        let hint = before
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .chars()
            .take(80)
            .collect();
        return Err(PatchError::ContextNotFound {
            path: path.to_string(),
            hint,
        });
    };

    let mut out = Vec::with_capacity(current.len() + after.len());
    out.extend_from_slice(&current[..at]);
    out.extend(after.iter().map(|l| l.to_string()));
    out.extend_from_slice(&current[at + before.len()..]);
    Ok(out)
}

/// First exact match of `needle`, then one ignoring trailing whitespace.
fn find_block(haystack: &[String], needle: &[&str]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let exact = haystack
        .windows(needle.len())
        .position(|w| w.iter().zip(needle).all(|(a, b)| a.as_str() == *b));
    exact.or_else(|| {
        haystack
            .windows(needle.len())
            .position(|w| w.iter().zip(needle).all(|(a, b)| a.trim_end() == b.trim_end()))
    })
}

fn patch_schema() -> ToolSchema {
    ToolSchema::new(
        "apply_patch",
        "Edit workspace files with a patch wrapped in '*** Begin Patch' / '*** End Patch', \
         using '*** Add File: <path>', '*** Update File: <path>' (@@ hunks with ' ', '-', '+' \
         lines) and '*** Delete File: <path>'. Changed files are backed up first.",
    )
    .with_parameter(ToolParameter::required(
        "patch",
        ParamType::String,
        "The full patch text, from '*** Begin Patch' to '*** End Patch'",
    ))
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let patch = params
            .get("patch")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("'patch' must be a string".into()))?;
        if patch.trim().is_empty() {
            return Ok("❌ patch 不能为空".into());
        }

        let planned = match self.plan(patch) {
            Ok(planned) => planned,
            Err(e) => {
                warn!(error = %e, "Patch refused");
                return Ok(format!("❌ 补丁应用失败: {e}"));
            }
        };
        let files = planned.iter().map(|p| p.path.as_str()).collect::<Vec<_>>();
        if !self.confirmed(&format!("apply_patch: {}", files.join(", "))) {
            return Ok(CANCELLED.into());
        }

        match self.commit(planned) {
            Ok(report) => Ok(self.render(&report)),
            Err(e) => {
                warn!(error = %e, "Patch failed while writing");
                Ok(format!("❌ 补丁应用失败: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/lib.rs"),
            "fn keep() {}\nfn old() {}\nfn tail() {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("stale.txt"), "remove me\n").unwrap();
        dir
    }

    fn tool_in(dir: &Path) -> ApplyPatchTool {
        ApplyPatchTool::new(&TerminalConfig::rooted_at(dir)).unwrap()
    }

    fn read(dir: &Path, rel: &str) -> String {
        std::fs::read_to_string(dir.join(rel)).unwrap()
    }

    fn backup_runs(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir.join(BACKUP_DIR)) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    const FULL_PATCH: &str = "*** Begin Patch
*** Add File: docs/notes.md
+# Notes
+first line
*** Update File: src/lib.rs
@@
 fn keep() {}
-fn old() {}
+fn new() {}
*** Delete File: stale.txt
*** End Patch";

    #[test]
    fn add_update_delete_with_backups() {
        let dir = workspace();
        let report = tool_in(dir.path()).apply(FULL_PATCH).unwrap();

        assert_eq!(report.files_changed, vec!["docs/notes.md", "src/lib.rs", "stale.txt"]);
        assert_eq!(read(dir.path(), "docs/notes.md"), "# Notes\nfirst line\n");
        assert_eq!(read(dir.path(), "src/lib.rs"), "fn keep() {}\nfn new() {}\nfn tail() {}\n");
        assert!(!dir.path().join("stale.txt").exists());

        assert_eq!(report.backups.len(), 2);
        let runs = backup_runs(dir.path());
        assert_eq!(runs.len(), 1);
        let stamp = runs[0].file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(stamp.len(), "YYYYMMDD_HHMMSS".len());
        assert_eq!(stamp.as_bytes()[8], b'_');
        assert!(stamp.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
        assert_eq!(
            std::fs::read_to_string(runs[0].join("src/lib.rs.bak")).unwrap(),
            "fn keep() {}\nfn old() {}\nfn tail() {}\n"
        );
        assert_eq!(std::fs::read_to_string(runs[0].join("stale.txt.bak")).unwrap(), "remove me\n");
    }

    #[test]
    fn failed_hunk_writes_nothing() {
        let dir = workspace();
        let patch = "*** Begin Patch
*** Add File: new.md
+created
*** Update File: src/lib.rs
@@
 fn keep() {}
-fn missing() {}
+fn new() {}
*** End Patch";
        let err = tool_in(dir.path()).apply(patch).unwrap_err();

        assert!(matches!(err, PatchError::ContextNotFound { ref hint, .. } if hint == "fn keep() {}"));
        assert!(!dir.path().join("new.md").exists());
        assert_eq!(read(dir.path(), "src/lib.rs"), "fn keep() {}\nfn old() {}\nfn tail() {}\n");
        assert!(backup_runs(dir.path()).is_empty());
    }

    #[test]
    fn paths_outside_workspace_are_refused() {
        let dir = workspace();
        let tool = tool_in(dir.path());
        for (path, absolute) in [("../escape.md", false), ("src/../../escape.md", false), ("/etc/motd", true)] {
            let patch = format!("*** Begin Patch\n*** Add File: {path}\n+x\n*** End Patch");
            let err = tool.apply(&patch).unwrap_err();
            if absolute {
                assert!(matches!(err, PatchError::AbsolutePath(_)), "{path}: {err}");
            } else {
                assert!(matches!(err, PatchError::Outside(_)), "{path}: {err}");
            }
        }
        assert!(!dir.path().parent().unwrap().join("escape.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_refused() {
        let dir = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "keep\n").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
            .unwrap();

        let patch = "*** Begin Patch\n*** Delete File: link.txt\n*** End Patch";
        let err = tool_in(dir.path()).apply(patch).unwrap_err();
        assert!(matches!(err, PatchError::Symlink(_)));
        assert_eq!(read(outside.path(), "secret.txt"), "keep\n");
    }

    #[test]
    fn backups_and_binary_suffixes_are_protected() {
        let dir = workspace();
        let tool = tool_in(dir.path());
        let err = tool
            .apply("*** Begin Patch\n*** Add File: .helloagents/backups/x.md\n+x\n*** End Patch")
            .unwrap_err();
        assert!(matches!(err, PatchError::StatePath(_)));

        let err = tool
            .apply("*** Begin Patch\n*** Add File: run.sh\n+rm -rf /\n*** End Patch")
            .unwrap_err();
        assert!(matches!(err, PatchError::Suffix(ref s) if s == "sh"));
    }

    #[test]
    fn limits_and_duplicates() {
        let dir = workspace();
        let tool = tool_in(dir.path());

        let many = (0..=MAX_FILES)
            .map(|i| format!("*** Add File: f{i}.txt\n+x"))
            .collect::<Vec<_>>()
            .join("\n");
        let err = tool.apply(&format!("*** Begin Patch\n{many}\n*** End Patch")).unwrap_err();
        assert!(matches!(err, PatchError::TooManyFiles { count: 11, max: 10 }));

        let big = "+line\n".repeat(MAX_CHANGED_LINES + 1);
        let err = tool
            .apply(&format!("*** Begin Patch\n*** Add File: big.txt\n{big}*** End Patch"))
            .unwrap_err();
        assert!(matches!(err, PatchError::TooLarge { .. }));

        let twice = "*** Begin Patch\n*** Delete File: stale.txt\n*** Delete File: stale.txt\n*** End Patch";
        assert!(matches!(tool.apply(twice).unwrap_err(), PatchError::Duplicate(_)));
    }

    #[test]
    fn add_over_existing_and_missing_targets_fail() {
        let dir = workspace();
        let tool = tool_in(dir.path());
        let err = tool
            .apply("*** Begin Patch\n*** Add File: stale.txt\n+x\n*** End Patch")
            .unwrap_err();
        assert!(matches!(err, PatchError::AlreadyExists(_)));
        let err = tool
            .apply("*** Begin Patch\n*** Delete File: nope.txt\n*** End Patch")
            .unwrap_err();
        assert!(matches!(err, PatchError::Missing(_)));
    }

    #[test]
    fn markers_are_found_inside_fences() {
        let ops = parse_patch("Here you go:\n```patch\n*** Begin Patch\n*** Delete File: a.txt\n*** End Patch\n```\n")
            .unwrap();
        assert_eq!(ops, vec![PatchOp::Delete { path: "a.txt".into() }]);
        assert!(matches!(parse_patch("*** Delete File: a.txt"), Err(PatchError::MissingBegin)));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Delete File: a.txt"),
            Err(PatchError::MissingEnd)
        ));
        assert!(matches!(
            parse_patch("*** Begin Patch\nrandom\n*** End Patch"),
            Err(PatchError::UnexpectedLine(_))
        ));
    }

    #[test]
    fn hunks_tolerate_trailing_whitespace_and_blank_context() {
        let current: Vec<String> = ["fn a() {}   ", "", "fn b() {}"].map(String::from).to_vec();
        let body: Vec<String> = ["@@", " fn a() {}", " ", "-fn b() {}", "+fn c() {}"]
            .map(String::from)
            .to_vec();
        let hunks = split_hunks(&body);
        assert_eq!(hunks.len(), 1);
        let out = apply_hunk(&current, &hunks[0], "x.rs").unwrap();
        assert_eq!(out, vec!["fn a() {}", "", "fn c() {}"]);
    }

    #[test]
    fn update_without_markers_replaces_file() {
        let body = vec!["brand".to_string(), "new".to_string()];
        assert_eq!(apply_update("old\n", &body, "f.txt").unwrap(), "brand\nnew\n");
        let only_added = vec!["+appended".to_string()];
        assert!(matches!(
            apply_update("old\n", &only_added, "f.txt"),
            Err(PatchError::EmptyHunk { .. })
        ));
    }

    #[tokio::test]
    async fn execute_reports_and_refuses_as_observations() {
        let dir = workspace();
        let tool = tool_in(dir.path());
        let params = |patch: &str| {
            let mut p = ToolParams::new();
            p.insert("patch".into(), Value::String(patch.into()));
            p
        };

        let out = tool.execute(params(FULL_PATCH)).await.unwrap();
        assert!(out.starts_with("✅ 补丁已应用（3 个文件）"), "{out}");
        assert!(out.contains("备份: .helloagents/backups/"));

        let out = tool
            .execute(params("*** Begin Patch\n*** Add File: ../x.md\n+x\n*** End Patch"))
            .await
            .unwrap();
        assert!(out.starts_with("❌ 补丁应用失败"), "{out}");
    }

    #[tokio::test]
    async fn confirmation_can_deny() {
        let dir = workspace();
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let config = TerminalConfig {
            confirm_dangerous: true,
            ..TerminalConfig::rooted_at(dir.path())
        };
        let tool = ApplyPatchTool::new(&config).unwrap().with_confirm(move |summary| {
            assert_eq!(summary, "apply_patch: docs/notes.md, src/lib.rs, stale.txt");
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        let mut params = ToolParams::new();
        params.insert("patch".into(), Value::String(FULL_PATCH.into()));

        assert_eq!(tool.execute(params).await.unwrap(), CANCELLED);
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("stale.txt").exists());
        assert!(!dir.path().join("docs").exists());
    }
}
