//! Shrinking oversized tool observations before they re-enter the prompt.

use async_trait::async_trait;
use helloagents_core::llm::{InvokeOptions, LlmClient};
use helloagents_core::message::Message;
use std::sync::Arc;
use tracing::warn;

/// Turns a long observation into a shorter one.
///
/// Returning `None` keeps the raw observation. The agent also ignores
/// summaries that are empty or not shorter than the input.
#[async_trait]
pub trait ObservationSummarizer: Send + Sync {
    async fn summarize(&self, tool_name: &str, tool_input: &str, observation: &str)
    -> Option<String>;
}

#[async_trait]
impl<F> ObservationSummarizer for F
where
    F: Fn(&str, &str, &str) -> String + Send + Sync,
{
    async fn summarize(
        &self,
        tool_name: &str,
        tool_input: &str,
        observation: &str,
    ) -> Option<String> {
        Some(self(tool_name, tool_input, observation))
    }
}

const SUMMARY_PROMPT: &str = "You compress tool output for an agent. Keep file paths, \
commands, error messages, numbers and conclusions. Drop repetition and boilerplate. \
Reply with the summary only.";

/// Summarizes with a (typically small) LLM.
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_tokens: 400,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ObservationSummarizer for LlmSummarizer {
    async fn summarize(
        &self,
        tool_name: &str,
        tool_input: &str,
        observation: &str,
    ) -> Option<String> {
        let messages = [
            Message::system(SUMMARY_PROMPT),
            Message::user(format!(
                "Tool: {tool_name}\nInput: {tool_input}\n\nOutput:\n{observation}"
            )),
        ];
        let options = InvokeOptions::default().with_max_tokens(self.max_tokens);
        match self.llm.invoke(&messages, &options).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(tool = %tool_name, error = %e, "observation summary failed");
                None
            }
        }
    }
}
