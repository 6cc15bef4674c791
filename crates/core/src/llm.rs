//! LLM client trait: the narrow interface the ReAct loop depends on.
//!
//! Provider SDKs live outside this workspace; anything that can turn a list
//! of messages into text can drive an agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::message::Message;

/// Characters per token assumed wherever a real tokenizer is not available.
pub const CHARS_PER_TOKEN: usize = 4;

/// Per-call knobs forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl InvokeOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A chat-completion capable model.
///
/// `Ok(None)` means the provider answered without any text; callers treat
/// it the same as an empty string.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model or provider name, used in logs.
    fn name(&self) -> &str;

    /// Send `messages` and return the completion text.
    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> std::result::Result<Option<String>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Parrot;

    #[async_trait]
    impl LlmClient for Parrot {
        fn name(&self) -> &str {
            "parrot"
        }

        async fn invoke(
            &self,
            messages: &[Message],
            _options: &InvokeOptions,
        ) -> std::result::Result<Option<String>, LlmError> {
            Ok(messages.last().map(|m| m.content.clone()))
        }
    }

    #[tokio::test]
    async fn client_is_object_safe() {
        let client: Box<dyn LlmClient> = Box::new(Parrot);
        let out = client
            .invoke(&[Message::user("ping")], &InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("ping"));
    }

    #[test]
    fn options_builder_sets_fields() {
        let opts = InvokeOptions::default().with_max_tokens(600).with_temperature(0.0);
        assert_eq!(opts.max_tokens, Some(600));
        assert_eq!(opts.temperature, Some(0.0));
    }
}
