//! End-to-end integration tests for the HelloAgents execution core.
//!
//! These tests drive the full stack from a task string to the final answer:
//! output parsing, tool dispatch through the default registry, the terminal
//! sandbox, and context construction.

use std::sync::Arc;

use async_trait::async_trait;
use helloagents_agent::test_helpers::ScriptedLlm;
use helloagents_agent::{
    ContextBuilder, ContextInput, ReactAgent, Termination, TokenCounter, TraceEntry, parse_action,
};
use helloagents_agent::context::HeuristicCounter;
use helloagents_config::{ContextConfig, TerminalConfig};
use helloagents_core::error::ToolError;
use helloagents_core::memory::{MemoryBackend, MemoryEntry};
use helloagents_core::message::Message;
use helloagents_core::tool::{ParamType, Tool, ToolParameter, ToolParams, ToolRegistry, ToolSchema};
use helloagents_memory::InMemoryBackend;
use helloagents_tools::default_registry;
use serde_json::json;

// ── Fixtures ─────────────────────────────────────────────────────────────

/// Echoes its params back as JSON.
struct RecordTool {
    schema: ToolSchema,
}

impl RecordTool {
    fn new() -> Self {
        Self {
            schema: ToolSchema::new("tool", "Records structured input")
                .with_parameter(ToolParameter::required("a", ParamType::String, "label"))
                .with_parameter(ToolParameter::required("n", ParamType::Integer, "count")),
        }
    }
}

#[async_trait]
impl Tool for RecordTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        Ok(serde_json::Value::Object(params).to_string())
    }
}

fn search_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_function("search", "Search the web", |_| "Paris".to_string());
    registry
}

fn observation_text(entry: &TraceEntry) -> &str {
    match entry {
        TraceEntry::Observation { text, .. } => text,
        other => panic!("expected observation, got {other:?}"),
    }
}

// ── Scenario (a): search then finish ─────────────────────────────────────

#[tokio::test]
async fn e2e_search_then_finish() {
    let llm = Arc::new(ScriptedLlm::new([
        "Thought: need capital\nAction: search[France capital]",
        "Thought: got it\nAction: Finish[Paris]",
    ]));
    let mut agent = ReactAgent::new(llm.clone(), Arc::new(search_registry()));

    let answer = agent.run("What is the capital of France?").await;

    assert_eq!(answer, "Paris");
    assert_eq!(agent.last_trace().len(), 3);
    assert!(agent.last_trace()[0].is_action());
    assert_eq!(observation_text(&agent.last_trace()[1]), "Paris");
    assert!(matches!(agent.last_trace()[2], TraceEntry::Finish { .. }));
    assert_eq!(llm.call_count(), 2);
}

// ── Scenario (b): bracket-safe JSON payload ──────────────────────────────

#[tokio::test]
async fn e2e_bracket_inside_json_string() {
    let (name, input) = parse_action(r#"tool[{"a":"b]c","n":1}]"#).unwrap();
    assert_eq!(name, "tool");
    assert_eq!(input, r#"{"a":"b]c","n":1}"#);

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(RecordTool::new()));
    let llm = Arc::new(ScriptedLlm::new([
        "Thought: record\nAction: tool[{\"a\":\"b]c\",\"n\":\"1\"}]",
        "Thought: done\nAction: Finish[recorded]",
    ]));
    let mut agent = ReactAgent::new(llm, Arc::new(registry));

    assert_eq!(agent.run("record it").await, "recorded");

    match &agent.last_trace()[0] {
        TraceEntry::Action { tool_input_raw, parsed_params, .. } => {
            assert_eq!(tool_input_raw, r#"{"a":"b]c","n":"1"}"#);
            let expected = json!({"a": "b]c", "n": 1});
            assert_eq!(parsed_params.as_ref(), expected.as_object());
        }
        other => panic!("expected action, got {other:?}"),
    }
    let echoed: serde_json::Value =
        serde_json::from_str(observation_text(&agent.last_trace()[1])).unwrap();
    assert_eq!(echoed, json!({"a": "b]c", "n": 1}));
}

// ── Scenario (c): repetition stop ────────────────────────────────────────

#[tokio::test]
async fn e2e_repeated_action_finalizes() {
    let llm = Arc::new(ScriptedLlm::new([
        "Thought: search\nAction: search[foo]",
        "Thought: search\nAction: search[foo]",
        "Thought: search\nAction: search[foo]",
        "Based on the searches so far: Paris.",
    ]));
    let mut agent = ReactAgent::new(llm.clone(), Arc::new(search_registry()));

    let outcome = agent.run_detailed("find foo").await;

    assert_eq!(outcome.termination, Termination::RepeatedAction);
    assert_eq!(outcome.answer, "Based on the searches so far: Paris.");
    assert_eq!(outcome.trace.iter().filter(|e| e.is_action()).count(), 2);
    assert!(observation_text(outcome.trace.last().unwrap()).starts_with("已检测到重复行动"));
    assert_eq!(llm.remaining(), 0);
}

// ── Scenario (d): sandbox refusal ────────────────────────────────────────

#[tokio::test]
async fn e2e_sandbox_refuses_parent_escape() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry(&TerminalConfig::rooted_at(dir.path()), None, None).unwrap();

    let out = registry
        .execute("terminal", r#"{"command": "cat ../../etc/passwd"}"#)
        .await;
    assert!(out.starts_with('❌'), "got: {out}");
    assert!(out.contains("工作目录外"));

    let llm = Arc::new(ScriptedLlm::new([
        "Thought: peek\nAction: terminal[{\"command\": \"cat ../../etc/passwd\"}]",
        "Thought: refused\nAction: Finish[not allowed]",
    ]));
    let mut agent = ReactAgent::new(llm, Arc::new(registry));
    assert_eq!(agent.run("read passwd").await, "not allowed");
    assert!(observation_text(&agent.last_trace()[1]).contains("工作目录外"));
}

// ── Scenario (e): shell pipe ─────────────────────────────────────────────

#[tokio::test]
async fn e2e_shell_pipe_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README.md"), "# readme").unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
    let registry = default_registry(&TerminalConfig::rooted_at(dir.path()), None, None).unwrap();

    let out = registry
        .execute("terminal", r#"{"command": "ls | grep .md", "shell_mode": true}"#)
        .await;

    assert!(out.contains("README.md"), "got: {out}");
    assert!(!out.contains("main.rs"));
    assert!(!out.contains("allow_dangerous"));
}

#[tokio::test]
async fn e2e_shell_redirection_is_gated() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry(&TerminalConfig::rooted_at(dir.path()), None, None).unwrap();

    let out = registry
        .execute("terminal", r#"{"command": "echo hi > out.txt", "shell_mode": true}"#)
        .await;

    assert!(out.contains("allow_dangerous=true"));
    assert!(!dir.path().join("out.txt").exists());
}

// ── Scenario (f): budget compression ─────────────────────────────────────

#[tokio::test]
async fn e2e_context_fits_small_budget() {
    let config = ContextConfig {
        max_tokens: 200,
        reserve_ratio: 0.1,
        ..ContextConfig::default()
    };
    let builder = ContextBuilder::new(config);
    let history: Vec<Message> = (0..5)
        .map(|i| Message::user(format!("{i}{}", "h".repeat(399))))
        .collect();
    let input = ContextInput::new("summarize the discussion")
        .with_instructions("You are a careful assistant.")
        .with_history(&history);

    let built = builder.build_with_report(&input).await;

    assert!(HeuristicCounter.count(&built.text) <= 180);
    assert!(built.report.total_tokens <= built.report.budget);
    assert_eq!(built.report.budget, 180);
    assert!(built.text.contains("[Role & Policies]"));
    assert!(built.text.contains("[Task]"));
}

// ── Full stack ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_context_fetch_reads_memory() {
    let dir = tempfile::tempdir().unwrap();
    let memory = InMemoryBackend::new();
    memory
        .store(MemoryEntry::new("tokio runtime uses work stealing").with_tag("notes"))
        .await
        .unwrap();
    let registry = default_registry(
        &TerminalConfig::rooted_at(dir.path()),
        Some(Arc::new(memory)),
        None,
    )
    .unwrap();

    let llm = Arc::new(ScriptedLlm::new([
        "Thought: check notes\nAction: context_fetch[{\"sources\": [\"memory\"], \"query\": \"tokio runtime\"}]",
        "Thought: found\nAction: Finish[work stealing]",
    ]));
    let mut agent = ReactAgent::new(llm, Arc::new(registry));

    assert_eq!(agent.run("how does tokio schedule?").await, "work stealing");
    let observation = observation_text(&agent.last_trace()[1]);
    assert!(observation.starts_with("[memory]\n- tokio runtime uses work stealing"));
}

#[tokio::test]
async fn e2e_multi_turn_with_context_builder() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    let registry = default_registry(&TerminalConfig::rooted_at(dir.path()), None, None).unwrap();

    let llm = Arc::new(ScriptedLlm::new([
        "Thought: read manifest\nAction: terminal[cat Cargo.toml]",
        "Thought: done\nAction: Finish[the crate is named demo]",
        "Thought: from evidence\nAction: Finish[demo]",
    ]));
    let mut agent = ReactAgent::new(llm.clone(), Arc::new(registry))
        .with_system_prompt("You inspect Rust projects.")
        .with_context_builder(ContextBuilder::new(ContextConfig::default()));

    assert_eq!(agent.run("what is the crate name?").await, "the crate is named demo");
    assert_eq!(agent.run("repeat just the name").await, "demo");

    let prompt = &llm.requests()[2].messages[0].content;
    assert!(prompt.contains("[Role & Policies]\nYou inspect Rust projects."));
    assert!(prompt.contains("[user] what is the crate name?"));
    assert!(prompt.contains("[Evidence]\nterminal[cat Cargo.toml] → "));
    assert!(prompt.contains("[Task]\nrepeat just the name"));
    assert_eq!(agent.history().len(), 4);
}

#[tokio::test]
async fn e2e_step_cap_bounds_llm_calls() {
    let llm = Arc::new(ScriptedLlm::new([
        "Thought: a\nAction: search[one]",
        "Thought: b\nAction: search[two]",
        "Thought: c\nAction: search[three]",
        "Partial: Paris",
    ]));
    let mut agent = ReactAgent::new(llm.clone(), Arc::new(search_registry())).with_max_steps(3);

    let outcome = agent.run_detailed("loop").await;

    assert_eq!(outcome.termination, Termination::MaxSteps);
    assert_eq!(outcome.answer, "Partial: Paris");
    assert!(outcome.llm_calls <= 3 + 2);
    assert_eq!(llm.call_count(), 4);
}
