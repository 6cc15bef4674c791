//! Token counting for context budgets.
//!
//! [`HeuristicCounter`] is the default: ~4 characters per token, rounded up.
//! With the `bpe` feature, [`BpeCounter`] counts with a HuggingFace
//! `tokenizer.json` (for example a cl100k export).

use helloagents_config::ContextConfig;
use helloagents_core::CHARS_PER_TOKEN;
use std::sync::Arc;

/// Counts tokens in a piece of prompt text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `ceil(chars / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Counter backed by a `tokenizers` BPE model.
#[cfg(feature = "bpe")]
pub struct BpeCounter {
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "bpe")]
impl BpeCounter {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, String> {
        tokenizers::Tokenizer::from_file(path.as_ref())
            .map(|tokenizer| Self { tokenizer })
            .map_err(|e| format!("failed to load tokenizer {}: {e}", path.as_ref().display()))
    }
}

#[cfg(feature = "bpe")]
impl TokenCounter for BpeCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                tracing::debug!(error = %e, "BPE encode failed, using heuristic");
                HeuristicCounter.count(text)
            }
        }
    }
}

/// The counter a builder should use under `config`.
///
/// Without the `bpe` feature, or when the tokenizer cannot be loaded, this
/// is the heuristic.
pub fn counter_for(config: &ContextConfig) -> Arc<dyn TokenCounter> {
    #[cfg(feature = "bpe")]
    if let Some(path) = &config.tokenizer_path {
        match BpeCounter::from_file(path) {
            Ok(counter) => return Arc::new(counter),
            Err(e) => tracing::warn!("{e}; falling back to chars/4 token estimate"),
        }
    }

    #[cfg(not(feature = "bpe"))]
    if config.tokenizer_path.is_some() {
        tracing::debug!("tokenizer_path set but the `bpe` feature is disabled");
    }

    Arc::new(HeuristicCounter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(HeuristicCounter.count(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(HeuristicCounter.count("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(HeuristicCounter.count("hello"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 4 CJK chars, 12 bytes
        assert_eq!(HeuristicCounter.count("上下文窗"), 1);
    }

    #[test]
    fn default_config_uses_heuristic() {
        let counter = counter_for(&ContextConfig::default());
        assert_eq!(counter.count(&"a".repeat(100)), 25);
    }

    #[cfg(feature = "bpe")]
    #[test]
    fn missing_tokenizer_falls_back() {
        let config = ContextConfig {
            tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
            ..ContextConfig::default()
        };
        assert_eq!(counter_for(&config).count("hello"), 2);
    }
}
