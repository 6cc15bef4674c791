//! Trace entries recorded during a single ReAct run.

use helloagents_core::tool::ToolParams;
use serde::{Deserialize, Serialize};

/// One step of the reasoning trace. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEntry {
    /// Reasoning that produced no dispatchable action.
    Thought { text: String },
    /// A dispatched tool call.
    Action {
        /// The action line as the model wrote it, e.g. `search[France capital]`.
        raw_text: String,
        tool_name: String,
        tool_input_raw: String,
        /// Parameters after parsing and coercion, when parsing succeeded.
        parsed_params: Option<ToolParams>,
        /// Length in chars of the raw observation, set when it was summarized.
        observation_full_len: Option<usize>,
        observation_summary: Option<String>,
    },
    Observation { text: String, truncated: bool },
    Finish { final_answer: String },
}

impl TraceEntry {
    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought { text: text.into() }
    }

    pub fn observation(text: impl Into<String>) -> Self {
        Self::Observation {
            text: text.into(),
            truncated: false,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action { .. })
    }

    /// The line shown to the model in the step history.
    pub fn render(&self) -> String {
        match self {
            Self::Thought { text } => format!("Thought: {text}"),
            Self::Action { raw_text, .. } => format!("Action: {raw_text}"),
            Self::Observation { text, .. } => format!("Observation: {text}"),
            Self::Finish { final_answer } => format!("Action: Finish[{final_answer}]"),
        }
    }
}

/// Render the last `window` entries, one per line.
pub fn render_history(trace: &[TraceEntry], window: usize) -> String {
    let start = trace.len().saturating_sub(window);
    trace[start..]
        .iter()
        .map(TraceEntry::render)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(input: &str) -> TraceEntry {
        TraceEntry::Action {
            raw_text: format!("search[{input}]"),
            tool_name: "search".into(),
            tool_input_raw: input.into(),
            parsed_params: None,
            observation_full_len: None,
            observation_summary: None,
        }
    }

    #[test]
    fn render_lines() {
        assert_eq!(action("foo").render(), "Action: search[foo]");
        assert_eq!(TraceEntry::observation("bar").render(), "Observation: bar");
        assert_eq!(TraceEntry::thought("hm").render(), "Thought: hm");
    }

    #[test]
    fn history_keeps_most_recent_suffix() {
        let trace: Vec<TraceEntry> = (0..30)
            .map(|i| TraceEntry::observation(format!("o{i}")))
            .collect();
        let rendered = render_history(&trace, 24);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 24);
        assert_eq!(lines[0], "Observation: o6");
        assert_eq!(lines[23], "Observation: o29");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(TraceEntry::observation("x")).unwrap();
        assert_eq!(json["kind"], "observation");
        assert_eq!(json["truncated"], false);
    }
}
