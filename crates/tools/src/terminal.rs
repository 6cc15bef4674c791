//! Terminal tool — run whitelisted commands inside the workspace.
//!
//! Two modes:
//! - **argv** (default): tokenized shell-style and executed directly, no shell.
//!   Every path-like argument must resolve inside the workspace, and
//!   options that run programs or write files (`find -exec`, `sed -i`,
//!   awk `system()`) need permission like `rm` does.
//! - **shell**: passed to `sh -c`, but only when every segment's head is
//!   whitelisted and no dangerous feature is present (unless permitted).
//!
//! Refusals are returned as observations starting with `❌`, not errors.

use async_trait::async_trait;
use helloagents_config::TerminalConfig;
use helloagents_core::error::ToolError;
use helloagents_core::tool::{ParamType, Tool, ToolParameter, ToolParams, ToolSchema};
use helloagents_security::command::{self, ALLOWED_COMMANDS, NON_PATH_COMMANDS};
use helloagents_security::{Sandbox, resolve_lenient};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Asked before running a command that trips the dangerous-operation gate.
pub type ConfirmFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

const TRUNCATION_MARKER: &str = "\n...output truncated...\n";
pub(crate) const CANCELLED: &str = "⛔️ 已取消执行（用户未确认）。";
const GATED: &str = "❌ 该命令包含写盘/子命令替换/高风险操作，需用户确认后再执行（allow_dangerous=true）";

/// Heads whose path arguments are sandboxed in shell mode.
const SHELL_SANDBOXED: &[&str] = &["rm", "chmod", "mkdir", "cd"];

/// Execute restricted commands in a bounded workspace.
///
/// Holds a mutable current directory, so give each concurrent task its own
/// instance rooted at the shared workspace.
pub struct TerminalTool {
    schema: ToolSchema,
    sandbox: Sandbox,
    current_dir: Mutex<PathBuf>,
    timeout_secs: u64,
    max_output_bytes: usize,
    allow_cd: bool,
    confirm_dangerous: bool,
    default_shell_mode: bool,
    confirm: Option<ConfirmFn>,
}

impl TerminalTool {
    /// Create the tool, creating the workspace directory if needed.
    pub fn new(config: &TerminalConfig) -> Result<Self, ToolError> {
        std::fs::create_dir_all(&config.workspace).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "terminal".into(),
            reason: format!("cannot create workspace {}: {e}", config.workspace.display()),
        })?;
        let sandbox = Sandbox::new(&config.workspace).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "terminal".into(),
            reason: e.to_string(),
        })?;
        info!(workspace = %sandbox.root().display(), "Terminal tool ready");

        Ok(Self {
            schema: terminal_schema(config.default_shell_mode),
            current_dir: Mutex::new(sandbox.root().to_path_buf()),
            sandbox,
            timeout_secs: config.timeout_secs,
            max_output_bytes: config.max_output_bytes,
            allow_cd: config.allow_cd,
            confirm_dangerous: config.confirm_dangerous,
            default_shell_mode: config.default_shell_mode,
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

    pub fn current_dir(&self) -> PathBuf {
        self.current_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Return to the workspace root.
    pub fn reset_dir(&self) {
        self.set_current_dir(self.sandbox.root().to_path_buf());
    }

    fn set_current_dir(&self, dir: PathBuf) {
        *self.current_dir.lock().unwrap_or_else(|e| e.into_inner()) = dir;
    }

    /// Run one command line. Every outcome, including refusals, is a string.
    pub async fn run_command(
        &self,
        command: &str,
        allow_dangerous: bool,
        shell_mode: bool,
    ) -> Result<String, ToolError> {
        let command = command.trim();
        if command.is_empty() {
            return Ok("❌ 命令不能为空".into());
        }
        if shell_mode {
            return self.run_shell(command, allow_dangerous).await;
        }

        let argv = match shell_words::split(command) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return Ok("❌ 命令不能为空".into()),
            Err(e) => return Ok(format!("❌ 命令解析失败: {e}")),
        };
        let head = argv[0].as_str();

        // ── Whitelist ──
        if command::is_dangerous(head) {
            if !allow_dangerous {
                return Ok(format!("❌ 高风险命令 {head} 需要人类确认（allow_dangerous=true）"));
            }
        } else if !command::is_allowed(head) {
            warn!(command = %head, "Command not in allowlist");
            return Ok(format!(
                "❌ 不允许的命令: {head}\n允许的命令: {}",
                ALLOWED_COMMANDS.join(", ")
            ));
        }

        if head == "git"
            && let Err(e) = command::check_git(&argv, allow_dangerous)
        {
            return Ok(format!("❌ {e}（仅允许 git status / git diff）"));
        }

        // ── Dangerous features anywhere in argv ──
        let features = command::argv_features(&argv);
        if !features.is_empty() && !allow_dangerous {
            let found = features.iter().map(|f| f.to_string()).collect::<Vec<_>>();
            warn!(command = %command, features = ?found, "Command gated");
            return Ok(format!("{GATED}\n检测到: {}", found.join(", ")));
        }

        // ── Confirmation ──
        if !features.is_empty() && !self.confirmed(command) {
            return Ok(CANCELLED.into());
        }

        if head == "cd" {
            return Ok(self.change_dir(&argv));
        }

        // ── Sandbox ──
        let cwd = self.current_dir();
        if !NON_PATH_COMMANDS.contains(&head)
            && let Some(outside) = self.first_outside(&cwd, &argv[1..])
        {
            return Ok(format!("❌ 拒绝在工作目录外操作: {outside}"));
        }

        debug!(command = %command, cwd = %cwd.display(), "Executing argv command");
        let mut cmd = Command::new(head);
        cmd.args(&argv[1..]);
        let Some(out) = self.spawn(cmd, &cwd).await? else {
            return Ok(self.timeout_message());
        };

        let text = self.truncate(combine(&out.stdout, &out.stderr));
        Ok(match out.status.code() {
            Some(0) if text.trim().is_empty() => "✅ 命令执行成功（无输出）".into(),
            Some(0) => text,
            code => format!("⚠️ 命令返回码: {}\n\n{text}", code.unwrap_or(-1)),
        })
    }

    async fn run_shell(&self, command: &str, allow_dangerous: bool) -> Result<String, ToolError> {
        let features = command::dangerous_features(command);
        if !features.is_empty() && !allow_dangerous {
            let found = features.iter().map(|f| f.to_string()).collect::<Vec<_>>();
            warn!(command = %command, features = ?found, "Shell command gated");
            return Ok(format!("{GATED}\n检测到: {}", found.join(", ")));
        }

        if let Err(violation) = command::check_segments(command, allow_dangerous) {
            warn!(command = %command, %violation, "Shell command refused");
            return Ok(format!("❌ shell_mode 下检测到非白名单命令: {violation}"));
        }

        let cwd = self.current_dir();
        for segment in command::split_segments(command) {
            let argv = command::words(&segment);
            if let Some(head) = argv.first()
                && SHELL_SANDBOXED.contains(&head.as_str())
                && let Some(outside) = self.first_outside(&cwd, &argv[1..])
            {
                return Ok(format!("❌ 拒绝在工作目录外操作: {outside}"));
            }
        }

        if !features.is_empty() && !self.confirmed(command) {
            return Ok(CANCELLED.into());
        }

        debug!(command = %command, cwd = %cwd.display(), "Executing shell command");
        let cmd = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        let Some(out) = self.spawn(cmd, &cwd).await? else {
            return Ok(self.timeout_message());
        };

        let text = self.truncate(combine(&out.stdout, &out.stderr));
        Ok(match out.status.code() {
            Some(0) if text.trim().is_empty() => "(no output)".into(),
            Some(0) => text,
            code => {
                let code = code.unwrap_or(-1);
                warn!(command = %command, exit_code = code, "Command failed");
                format!("命令执行失败 (返回码 {code}):\n{text}")
            }
        })
    }

    fn change_dir(&self, argv: &[String]) -> String {
        if !self.allow_cd {
            return "❌ cd 命令已禁用".into();
        }
        let cwd = self.current_dir();
        let Some(target) = argv.get(1) else {
            return format!("当前目录: {}", cwd.display());
        };

        let new_dir = if target == "~" {
            self.sandbox.root().to_path_buf()
        } else {
            match self.sandbox.resolve(&cwd, target) {
                Ok(dir) => dir,
                Err(_) => {
                    return format!(
                        "❌ 不允许访问工作目录外的路径: {}",
                        resolve_lenient(&cwd.join(target)).display()
                    );
                }
            }
        };

        if !new_dir.exists() {
            return format!("❌ 目录不存在: {}", new_dir.display());
        }
        if !new_dir.is_dir() {
            return format!("❌ 不是目录: {}", new_dir.display());
        }
        self.set_current_dir(new_dir.clone());
        format!("✅ 切换到目录: {}", new_dir.display())
    }

    /// First argument that resolves outside the workspace. Flags are
    /// skipped, except for `--opt=path` values.
    fn first_outside<'a>(&self, cwd: &Path, args: &'a [String]) -> Option<&'a str> {
        args.iter().map(String::as_str).find(|arg| {
            let candidate = match arg.strip_prefix('-') {
                Some(flag) => match flag.split_once('=') {
                    Some((_, value)) if value.contains('/') => value,
                    _ => return false,
                },
                None => arg,
            };
            self.sandbox.resolve(cwd, candidate).is_err()
        })
    }

    fn confirmed(&self, command: &str) -> bool {
        if !self.confirm_dangerous {
            return true;
        }
        match &self.confirm {
            Some(confirm) => confirm(command),
            None => {
                warn!(command = %command, "Dangerous command needs confirmation but no prompt is installed");
                false
            }
        }
    }

    /// `Ok(None)` on timeout; the child is killed when its future drops.
    async fn spawn(
        &self,
        mut cmd: Command,
        cwd: &Path,
    ) -> Result<Option<std::process::Output>, ToolError> {
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output()).await {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(e)) => Err(ToolError::ExecutionFailed {
                tool_name: "terminal".into(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(timeout_secs = self.timeout_secs, "Command timed out");
                Ok(None)
            }
        }
    }

    fn timeout_message(&self) -> String {
        format!("❌ 命令超时（>{}s）", self.timeout_secs)
    }

    fn truncate(&self, mut text: String) -> String {
        if text.len() <= self.max_output_bytes {
            return text;
        }
        let mut cut = self.max_output_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
        text
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.into_owned(),
        (true, false) => stderr.into_owned(),
        (false, false) => format!("{stdout}\n[stderr]\n{stderr}"),
    }
}

fn terminal_schema(default_shell_mode: bool) -> ToolSchema {
    ToolSchema::new(
        "terminal",
        "Run a whitelisted command inside the workspace (ls, cat, head, grep, rg, find, wc, \
         git status/diff, ...). Pass JSON such as {\"command\": \"rg -n TODO src\"}; set \
         shell_mode=true for pipes.",
    )
    .with_parameter(ToolParameter::required(
        "command",
        ParamType::String,
        "Command to run, e.g. 'ls -la', 'cat README.md', 'grep -rn pattern src'",
    ))
    .with_parameter(
        ToolParameter::optional(
            "allow_dangerous",
            ParamType::Boolean,
            "Permit writes, substitution and rm/chmod. Only set after the user agreed.",
        )
        .with_default(Value::Bool(false)),
    )
    .with_parameter(
        ToolParameter::optional(
            "shell_mode",
            ParamType::Boolean,
            "Run through the shell (pipes, &&, ;). Segments must still be whitelisted.",
        )
        .with_default(Value::Bool(default_shell_mode)),
    )
}

#[async_trait]
impl Tool for TerminalTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("'command' must be a string".into()))?;
        let allow_dangerous = params
            .get("allow_dangerous")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let shell_mode = params
            .get("shell_mode")
            .and_then(Value::as_bool)
            .unwrap_or(self.default_shell_mode);

        self.run_command(command, allow_dangerous, shell_mode).await
    }
}
