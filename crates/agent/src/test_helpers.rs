//! Shared test doubles.

use async_trait::async_trait;
use helloagents_core::error::LlmError;
use helloagents_core::llm::{InvokeOptions, LlmClient};
use helloagents_core::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One recorded `invoke` call.
#[derive(Debug, Clone)]
pub struct Request {
    pub messages: Vec<Message>,
    pub options: InvokeOptions,
}

/// An LLM that replays a script of canned replies.
///
/// Each call to `invoke` pops the next reply and records the request.
/// Panics if more calls are made than replies provided, so tests pin the
/// exact number of LLM round trips.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<Option<String>, LlmError>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedLlm {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::from_results(replies.into_iter().map(|r| Ok(Some(r.into()))).collect())
    }

    /// Script that may include empty replies (`Ok(None)`) and failures.
    pub fn from_results(replies: Vec<Result<Option<String>, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<Option<String>, LlmError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(Request {
            messages: messages.to_vec(),
            options: options.clone(),
        });
        let call = requests.len();
        drop(requests);

        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => panic!("ScriptedLlm: no more replies (call #{call})"),
        }
    }
}
