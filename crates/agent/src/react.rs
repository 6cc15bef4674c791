//! The ReAct pattern: a Thought → Action → Observation loop.
//!
//! Each step asks the LLM for one `Thought:` / `Action:` pair, dispatches
//! the action through the [`ToolRegistry`], and appends the observation to
//! the trace that the next prompt shows. The loop ends on:
//!
//! - `Finish[...]`: the payload is the answer
//! - `max_steps` reached
//! - the same action repeated `repeat_action_threshold` times in a row
//! - an empty or failed LLM reply
//! - a reply with no action even after one strict-format repair call
//! - cancellation, checked at every step boundary
//!
//! Every ending except `Finish` and cancellation gets one finalize call
//! that asks the model to converge without tools. A run therefore costs at
//! most `max_steps + 2` LLM calls and never returns an error: the worst
//! case is a fixed apology.

use crate::context::{ContextBuilder, ContextInput};
use crate::parser::{ParsedOutput, is_finish, parse_action, parse_finish, parse_output};
use crate::summarizer::ObservationSummarizer;
use crate::trace::{TraceEntry, render_history};
use helloagents_config::AgentConfig;
use helloagents_core::llm::{InvokeOptions, LlmClient};
use helloagents_core::message::Message;
use helloagents_core::tool::ToolRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default step prompt. `{tools}`, `{question}` and `{history}` are
/// substituted once per step.
pub const DEFAULT_REACT_PROMPT: &str = "你是一个具备推理和行动能力的 AI 助手。通过调用工具收集信息，然后给出准确的最终答案。

## 可用工具
{tools}

## 回复格式
每次只执行一步，严格输出两行：
Thought: 分析当前进展，决定下一步
Action: tool_name[tool_input] 或 Finish[最终答案]

工具参数优先使用 JSON，例如 terminal[{\"command\": \"ls\"}]。
只有信息足够时才使用 Finish。

## 当前任务
Question: {question}

## 执行历史
{history}

Thought:";

/// Returned when no better answer could be produced.
pub const APOLOGY: &str =
    "抱歉，我无法在限定步数内完成这个任务。你可以缩小范围或指定目标文件/模块。";

const STOP_HINT: &str =
    "已检测到重复行动，建议停止继续工具调用并给出当前能提供的结论/下一步。";
const INVALID_ACTION: &str = "无效的Action格式，请检查。";
const SUMMARY_MARKER: &str = "\n...truncated...\n";

const REPAIR_PROMPT: &str = "You MUST output exactly two lines:\n\
Thought: ...\n\
Action: tool_name[tool_input] OR Finish[final answer]\n\
No extra text. No markdown headers.";
const REPAIR_MAX_TOKENS: u32 = 200;

const FINALIZE_PROMPT: &str = "你是 ReAct 代理的最终收敛器，工具调用阶段已经结束。\
请基于已有的 Thought/Action/Observation 历史给出尽可能有用的最终回答。要求：\n\
1) 不要再调用工具\n\
2) 列出已经收集到的证据与发现\n\
3) 如果信息不足，说明还缺什么，并给出 1-3 条最小化的下一步建议";
const FINALIZE_MAX_TOKENS: u32 = 600;

const PLACEHOLDERS: [&str; 3] = ["{tools}", "{question}", "{history}"];

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Finished,
    MaxSteps,
    RepeatedAction,
    EmptyResponse,
    Unparseable,
    LlmFailure,
    Cancelled,
}

/// The result of a ReAct execution.
#[derive(Debug, Clone)]
pub struct ReactOutcome {
    /// The final answer text.
    pub answer: String,
    /// Complete reasoning trace.
    pub trace: Vec<TraceEntry>,
    /// Steps started (each is one step-prompt LLM call).
    pub steps: usize,
    /// LLM calls including repair and finalize.
    pub llm_calls: usize,
    pub termination: Termination,
}

/// Per-run bookkeeping.
#[derive(Default)]
struct RunState {
    trace: Vec<TraceEntry>,
    steps: usize,
    llm_calls: usize,
    repaired: bool,
    last_signature: Option<String>,
    repeat_count: usize,
}

/// A ReAct agent.
///
/// One agent runs one task at a time (`run` takes `&mut self`). For
/// parallel tasks build several agents sharing the `Arc<ToolRegistry>`,
/// each with its own terminal tool.
pub struct ReactAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    prompt_template: String,
    max_steps: usize,
    summarizer: Option<Arc<dyn ObservationSummarizer>>,
    summarize_threshold_chars: usize,
    finalize_on_max_steps: bool,
    early_stop_on_repeat: bool,
    repeat_action_threshold: usize,
    history_window: usize,
    temperature: Option<f32>,
    context: Option<ContextBuilder>,
    history: Vec<Message>,
    last_trace: Vec<TraceEntry>,
    last_tool_summaries: Vec<String>,
    cancel: CancellationToken,
}

impl ReactAgent {
    /// Create an agent with default settings (20 steps, repeat threshold 2).
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        Self::from_config(llm, tools, &AgentConfig::default())
    }

    /// Create an agent from the `[agent]` config table.
    pub fn from_config(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, config: &AgentConfig) -> Self {
        Self {
            name: config.name.clone(),
            llm,
            tools,
            system_prompt: config.system_prompt.clone(),
            prompt_template: DEFAULT_REACT_PROMPT.to_string(),
            max_steps: config.max_steps,
            summarizer: None,
            summarize_threshold_chars: config.summarize_threshold_chars,
            finalize_on_max_steps: config.finalize_on_max_steps,
            early_stop_on_repeat: config.early_stop_on_repeat,
            repeat_action_threshold: config.repeat_action_threshold.max(1),
            history_window: config.history_window.max(1),
            temperature: config.temperature,
            context: None,
            history: Vec::new(),
            last_trace: Vec::new(),
            last_tool_summaries: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Replace the step prompt. Unknown `{...}` sequences stay literal.
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Summarize observations longer than the threshold (chars).
    pub fn with_summarizer(mut self, summarizer: impl ObservationSummarizer + 'static) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    pub fn with_summarize_threshold(mut self, chars: usize) -> Self {
        self.summarize_threshold_chars = chars;
        self
    }

    pub fn with_finalize_on_max_steps(mut self, enabled: bool) -> Self {
        self.finalize_on_max_steps = enabled;
        self
    }

    pub fn with_early_stop_on_repeat(mut self, enabled: bool) -> Self {
        self.early_stop_on_repeat = enabled;
        self
    }

    pub fn with_repeat_action_threshold(mut self, threshold: usize) -> Self {
        self.repeat_action_threshold = threshold.max(1);
        self
    }

    /// How many trace entries each step prompt shows.
    pub fn with_history_window(mut self, entries: usize) -> Self {
        self.history_window = entries.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Build each task prompt as base context over the conversation history.
    pub fn with_context_builder(mut self, builder: ContextBuilder) -> Self {
        self.context = Some(builder);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// User tasks and final answers from earlier runs.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn add_message(&mut self, message: Message) {
        self.history.push(message);
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.last_tool_summaries.clear();
    }

    /// Trace of the most recent run.
    pub fn last_trace(&self) -> &[TraceEntry] {
        &self.last_trace
    }

    /// Token that stops the current run at its next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install a fresh token after a cancelled run.
    pub fn reset_cancellation(&mut self) {
        self.cancel = CancellationToken::new();
    }

    /// Run a task and return the answer.
    pub async fn run(&mut self, task: &str) -> String {
        self.run_detailed(task).await.answer
    }

    /// Run a task and return the answer with its trace and counters.
    pub async fn run_detailed(&mut self, task: &str) -> ReactOutcome {
        info!(agent = %self.name, llm = %self.llm.name(), max_steps = self.max_steps, "ReAct run starting");

        let question = self.task_prompt(task).await;
        let tools_desc = self.tools.describe();
        let mut run = RunState::default();

        let (answer, termination) = match self.step_loop(&question, &tools_desc, &mut run).await {
            Ok(answer) => (answer, Termination::Finished),
            Err(Termination::Cancelled) => (APOLOGY.to_string(), Termination::Cancelled),
            Err(_) if self.cancel.is_cancelled() => {
                info!("Run cancelled before finalize");
                (APOLOGY.to_string(), Termination::Cancelled)
            }
            Err(reason) if self.finalize_on_max_steps => {
                let answer = self
                    .finalize(task, &tools_desc, &mut run)
                    .await
                    .unwrap_or_else(|| APOLOGY.to_string());
                (answer, reason)
            }
            Err(reason) => (APOLOGY.to_string(), reason),
        };

        self.history.push(Message::user(task));
        self.history.push(Message::assistant(answer.clone()));
        self.last_tool_summaries = tool_summaries(&run.trace);
        self.last_trace = run.trace.clone();

        info!(
            steps = run.steps,
            llm_calls = run.llm_calls,
            termination = ?termination,
            "ReAct run finished"
        );

        ReactOutcome {
            answer,
            trace: run.trace,
            steps: run.steps,
            llm_calls: run.llm_calls,
            termination,
        }
    }

    async fn task_prompt(&self, task: &str) -> String {
        let Some(builder) = &self.context else {
            return task.to_string();
        };
        let mut input = ContextInput::new(task)
            .with_history(&self.history)
            .with_tool_summaries(&self.last_tool_summaries);
        if let Some(system) = &self.system_prompt {
            input = input.with_instructions(system);
        }
        builder.build_base(&input).await
    }

    /// Steps until `Finish` (`Ok`) or another ending (`Err`).
    async fn step_loop(
        &self,
        question: &str,
        tools_desc: &str,
        run: &mut RunState,
    ) -> Result<String, Termination> {
        loop {
            if self.cancel.is_cancelled() {
                info!(step = run.steps, "Run cancelled");
                return Err(Termination::Cancelled);
            }
            if run.steps >= self.max_steps {
                warn!(max_steps = self.max_steps, "ReAct: max steps reached");
                return Err(Termination::MaxSteps);
            }
            run.steps += 1;
            debug!(step = run.steps, "ReAct step");

            let history = render_history(&run.trace, self.history_window);
            let prompt = render_template(&self.prompt_template, tools_desc, question, &history);
            let mut messages = Vec::with_capacity(2);
            // With a context builder the system prompt is already in [Role & Policies].
            if self.context.is_none()
                && let Some(system) = &self.system_prompt
            {
                messages.push(Message::system(system.clone()));
            }
            messages.push(Message::user(prompt));

            run.llm_calls += 1;
            let response = match self.llm.invoke(&messages, &self.options(None)).await {
                Ok(Some(text)) if !text.trim().is_empty() => text,
                Ok(_) => {
                    warn!(step = run.steps, "LLM returned an empty response");
                    return Err(Termination::EmptyResponse);
                }
                Err(e) => {
                    warn!(step = run.steps, error = %e, "LLM call failed");
                    return Err(Termination::LlmFailure);
                }
            };

            let mut parsed = parse_output(&response);
            if parsed.action.is_none() {
                if run.repaired {
                    warn!(step = run.steps, "No action in reply, repair already used");
                    return Err(Termination::Unparseable);
                }
                run.repaired = true;
                warn!(step = run.steps, "No action in reply, requesting strict rewrite");
                parsed = self.repair(&response, run).await;
            }
            let Some(action) = parsed.action else {
                warn!(step = run.steps, "Could not parse an action, stopping");
                return Err(Termination::Unparseable);
            };

            if is_finish(&action) {
                let answer = parse_finish(&action).unwrap_or_default();
                run.trace.push(TraceEntry::Finish {
                    final_answer: answer.clone(),
                });
                return Ok(answer);
            }

            let Some((tool_name, tool_input)) = parse_action(&action) else {
                debug!(%action, "Invalid action format");
                if let Some(thought) = parsed.thought {
                    run.trace.push(TraceEntry::thought(thought));
                }
                run.trace.push(TraceEntry::observation(INVALID_ACTION));
                continue;
            };

            if self.early_stop_on_repeat {
                let signature = format!("{tool_name}|{tool_input}").trim().to_string();
                if run.last_signature.as_deref() == Some(signature.as_str()) {
                    run.repeat_count += 1;
                } else {
                    run.repeat_count = 0;
                }
                run.last_signature = Some(signature);

                if run.repeat_count >= self.repeat_action_threshold {
                    warn!(tool = %tool_name, repeats = run.repeat_count, "Repeated action, stopping");
                    run.trace.push(TraceEntry::observation(STOP_HINT));
                    return Err(Termination::RepeatedAction);
                }
            }

            debug!(tool = %tool_name, input = %tool_input, "Dispatching action");
            let invocation = self.tools.invoke(&tool_name, &tool_input).await;
            let (observation, full_len, summary) =
                self.condense(&tool_name, &tool_input, invocation.output).await;

            run.trace.push(TraceEntry::Action {
                raw_text: action,
                tool_name,
                tool_input_raw: tool_input,
                parsed_params: invocation.params,
                observation_full_len: full_len,
                observation_summary: summary.clone(),
            });
            run.trace.push(TraceEntry::Observation {
                text: observation,
                truncated: summary.is_some(),
            });
        }
    }

    async fn repair(&self, response: &str, run: &mut RunState) -> ParsedOutput {
        let messages = [
            Message::system(REPAIR_PROMPT),
            Message::user(format!(
                "Rewrite the following into the required two-line format:\n\n{response}"
            )),
        ];
        run.llm_calls += 1;
        match self.llm.invoke(&messages, &self.options(Some(REPAIR_MAX_TOKENS))).await {
            Ok(Some(text)) => parse_output(&text),
            Ok(None) => ParsedOutput::default(),
            Err(e) => {
                warn!(error = %e, "Repair call failed");
                ParsedOutput::default()
            }
        }
    }

    /// Apply the summarizer to oversized observations.
    /// Returns `(observation, full_len, summary)`.
    async fn condense(
        &self,
        tool_name: &str,
        tool_input: &str,
        output: String,
    ) -> (String, Option<usize>, Option<String>) {
        let Some(summarizer) = &self.summarizer else {
            return (output, None, None);
        };
        let full_len = output.chars().count();
        if full_len <= self.summarize_threshold_chars {
            return (output, None, None);
        }

        match summarizer.summarize(tool_name, tool_input, &output).await {
            Some(summary) if !summary.trim().is_empty() && summary.trim().chars().count() < full_len => {
                let summary = summary.trim().to_string();
                debug!(tool = %tool_name, full_len, summary_len = summary.chars().count(), "Observation summarized");
                (format!("{summary}{SUMMARY_MARKER}"), Some(full_len), Some(summary))
            }
            _ => {
                debug!(tool = %tool_name, "Summary unusable, keeping raw observation");
                (output, None, None)
            }
        }
    }

    async fn finalize(&self, task: &str, tools_desc: &str, run: &mut RunState) -> Option<String> {
        let trace = render_history(&run.trace, self.history_window);
        let messages = [
            Message::system(FINALIZE_PROMPT),
            Message::user(format!(
                "Question:\n{task}\n\nTools:\n{tools_desc}\n\nTrace:\n{trace}"
            )),
        ];
        run.llm_calls += 1;
        match self.llm.invoke(&messages, &self.options(Some(FINALIZE_MAX_TOKENS))).await {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                warn!("Finalize returned nothing");
                None
            }
            Err(e) => {
                warn!(error = %e, "Finalize call failed");
                None
            }
        }
    }

    fn options(&self, max_tokens: Option<u32>) -> InvokeOptions {
        InvokeOptions {
            max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Substitute the step placeholders in one pass; substituted text is not
/// scanned again.
fn render_template(template: &str, tools: &str, question: &str, history: &str) -> String {
    let values = [tools, question, history];
    let mut out = String::with_capacity(template.len() + tools.len() + question.len() + history.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match PLACEHOLDERS.iter().position(|p| tail.starts_with(p)) {
            Some(i) => {
                out.push_str(values[i]);
                rest = &tail[PLACEHOLDERS[i].len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// One line per tool call, fed to the next run's `[Evidence]`.
fn tool_summaries(trace: &[TraceEntry]) -> Vec<String> {
    trace
        .windows(2)
        .filter_map(|pair| match pair {
            [
                TraceEntry::Action {
                    tool_name,
                    tool_input_raw,
                    observation_summary,
                    ..
                },
                TraceEntry::Observation { text, .. },
            ] => {
                let body = observation_summary.as_deref().unwrap_or(text);
                Some(format!(
                    "{tool_name}[{}] → {}",
                    one_line(tool_input_raw, 80),
                    one_line(body, 200)
                ))
            }
            _ => None,
        })
        .collect()
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}
