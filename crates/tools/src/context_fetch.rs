//! Context fetch tool — on-demand context for lazy-fetch mode.
//!
//! The base context carries only instructions, recent history and tool
//! summaries. When the model needs more it calls `context_fetch` with the
//! sources it wants (`memory`, `files`, `knowledge`) and a token budget
//! that is split evenly between them.

use async_trait::async_trait;
use helloagents_core::CHARS_PER_TOKEN;
use helloagents_core::error::ToolError;
use helloagents_core::memory::{MemoryBackend, MemoryQuery, Retriever};
use helloagents_core::tool::{ParamType, Tool, ToolParameter, ToolParams, ToolSchema};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const CACHE_CAPACITY: usize = 20;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BUDGET_TOKENS: i64 = 800;
const MIN_BUDGET_TOKENS: i64 = 50;
const MAX_BUDGET_TOKENS: i64 = 100_000;
const KNOWN_SOURCES: &str = "memory, files, knowledge";

/// Fetch extra context from memory, workspace files, or a knowledge base.
pub struct ContextFetchTool {
    schema: ToolSchema,
    workspace: PathBuf,
    memory: Option<Arc<dyn MemoryBackend>>,
    knowledge: Option<Arc<dyn Retriever>>,
    cache: Mutex<VecDeque<(String, String)>>,
}

impl ContextFetchTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            schema: fetch_schema(),
            workspace: workspace.into(),
            memory: None,
            knowledge: None,
            cache: Mutex::new(VecDeque::with_capacity(CACHE_CAPACITY)),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn Retriever>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    fn remember(&self, key: String, value: String) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(k, _)| *k != key);
        if cache.len() == CACHE_CAPACITY {
            cache.pop_front();
        }
        cache.push_back((key, value));
    }

    async fn fetch_memory(&self, query: &str, max_chars: usize) -> String {
        let Some(memory) = &self.memory else {
            return "(未配置记忆后端)".into();
        };
        match memory.search(MemoryQuery::new(query).with_limit(5)).await {
            Ok(entries) if entries.is_empty() => "(无结果)".into(),
            Ok(entries) => clip(
                &entries
                    .iter()
                    .map(|e| format!("- {} (score {:.2})", e.content, e.score))
                    .collect::<Vec<_>>()
                    .join("\n"),
                max_chars,
            ),
            Err(e) => format!("❌ 记忆检索失败: {e}"),
        }
    }

    async fn fetch_knowledge(&self, query: &str, max_chars: usize) -> String {
        let Some(knowledge) = &self.knowledge else {
            return "(未配置知识库)".into();
        };
        match knowledge.retrieve(query, 5).await {
            Ok(chunks) if chunks.is_empty() => "(无结果)".into(),
            Ok(chunks) => clip(
                &chunks
                    .iter()
                    .map(|c| format!("- ({}) {}", c.source, c.content))
                    .collect::<Vec<_>>()
                    .join("\n"),
                max_chars,
            ),
            Err(e) => format!("❌ 知识库检索失败: {e}"),
        }
    }

    /// `rg` when available, `grep -rn` otherwise. Exit code 1 means no match.
    async fn fetch_files(&self, query: &str, paths: Option<&str>, max_chars: usize) -> String {
        let mut rg = Command::new("rg");
        rg.args(["--color=never", "-n", "--max-count", "5", "-C", "2"]);
        if let Some(glob) = paths {
            rg.args(["-g", glob]);
        }
        rg.args(["--", query, "."]);

        let output = match self.search(rg).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("rg not found, falling back to grep");
                let mut grep = Command::new("grep");
                grep.args(["-rn", "-m", "5"]);
                if let Some(glob) = paths {
                    grep.arg(format!("--include={glob}"));
                }
                grep.args(["--", query, "."]);
                self.search(grep).await
            }
            other => other,
        };

        match output {
            Ok(out) if out.status.code() == Some(1) => "(无结果)".into(),
            Ok(out) if out.status.success() => {
                clip(String::from_utf8_lossy(&out.stdout).trim_end(), max_chars)
            }
            Ok(out) => format!(
                "❌ 文件检索失败: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                format!("❌ 文件检索超时（>{}s）", SEARCH_TIMEOUT.as_secs())
            }
            Err(e) => format!("❌ 文件检索失败: {e}"),
        }
    }

    async fn search(&self, mut cmd: Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(SEARCH_TIMEOUT, cmd.output()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "search timed out")),
        }
    }
}

fn fetch_schema() -> ToolSchema {
    ToolSchema::new(
        "context_fetch",
        "Fetch more context on demand. sources: any of memory, files, knowledge. \
         Example: {\"sources\": [\"files\"], \"query\": \"fn parse_output\", \"paths\": \"*.rs\"}",
    )
    .with_parameter(ToolParameter::required(
        "sources",
        ParamType::Array,
        "Sources to query: memory, files, knowledge",
    ))
    .with_parameter(ToolParameter::required("query", ParamType::String, "What to look for"))
    .with_parameter(ToolParameter::optional(
        "paths",
        ParamType::String,
        "Glob restricting file search, e.g. '*.rs'",
    ))
    .with_parameter(
        ToolParameter::optional("budget_tokens", ParamType::Integer, "Total output budget")
            .with_default(Value::from(DEFAULT_BUDGET_TOKENS)),
    )
}

/// Sources as given: an array, or a comma-separated string.
fn source_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split([',', '，', ' '])
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Keep at most `max_chars` characters, marking the cut.
fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n...truncated...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Tool for ContextFetchTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let sources = source_list(params.get("sources"));
        if sources.is_empty() {
            return Ok(format!("❌ sources 不能为空（可用: {KNOWN_SOURCES}）"));
        }
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok("❌ query 不能为空".into());
        }
        let paths = params.get("paths").and_then(Value::as_str).filter(|p| !p.is_empty());
        let budget = params
            .get("budget_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_BUDGET_TOKENS)
            .clamp(MIN_BUDGET_TOKENS, MAX_BUDGET_TOKENS) as usize;

        let key = format!("{}|{query}|{}|{budget}", sources.join(","), paths.unwrap_or(""));
        if let Some(hit) = self.cached(&key) {
            debug!(%key, "context_fetch cache hit");
            return Ok(hit);
        }

        // Split evenly between sources.
        let share = budget.saturating_mul(CHARS_PER_TOKEN) / sources.len();
        let mut sections = Vec::with_capacity(sources.len());
        for source in &sources {
            let body = match source.as_str() {
                "memory" => self.fetch_memory(query, share).await,
                "files" => self.fetch_files(query, paths, share).await,
                "knowledge" => self.fetch_knowledge(query, share).await,
                other => format!("未知数据源: {other}（可用: {KNOWN_SOURCES}）"),
            };
            sections.push(format!("[{source}]\n{body}"));
        }

        let output = sections.join("\n\n");
        self.remember(key, output.clone());
        Ok(output)
    }
}
