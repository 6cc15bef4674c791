//! A fixed set of knowledge chunks behind the [`Retriever`] trait.

use async_trait::async_trait;
use helloagents_core::error::MemoryError;
use helloagents_core::memory::{KnowledgeChunk, Retriever};

use crate::keyword_score;

/// Keyword retrieval over chunks supplied up front (docs, READMEs, notes).
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeBase {
    chunks: Vec<KnowledgeChunk>,
}

impl StaticKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(mut self, source: impl Into<String>, content: impl Into<String>) -> Self {
        self.chunks.push(KnowledgeChunk {
            content: content.into(),
            source: source.into(),
            score: 0.0,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl Retriever for StaticKnowledgeBase {
    fn name(&self) -> &str {
        "static"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeChunk>, MemoryError> {
        let mut hits: Vec<KnowledgeChunk> = self
            .chunks
            .iter()
            .map(|c| KnowledgeChunk {
                score: keyword_score(query, &c.content),
                ..c.clone()
            })
            .filter(|c| c.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrieves_best_matches_first() {
        let kb = StaticKnowledgeBase::new()
            .with_chunk("guide.md", "The registry parses JSON payloads")
            .with_chunk("faq.md", "Terminal tool refuses paths outside the workspace")
            .with_chunk("misc.md", "Nothing relevant");

        let hits = kb.retrieve("terminal workspace", 2).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "faq.md");
        assert_eq!(hits[0].score, 1.0);
    }
}
