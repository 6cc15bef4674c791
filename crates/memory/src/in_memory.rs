//! In-memory backend — ephemeral sessions and tests.

use async_trait::async_trait;
use helloagents_core::error::MemoryError;
use helloagents_core::memory::{MemoryBackend, MemoryEntry, MemoryQuery};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::keyword_score;

/// Stores memories in a Vec behind an async lock. Cloning shares the store.
#[derive(Clone)]
pub struct InMemoryBackend {
    entries: Arc<RwLock<Vec<MemoryEntry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn store(&self, mut entry: MemoryEntry) -> Result<String, MemoryError> {
        if entry.id.is_empty() {
            entry.id = Uuid::new_v4().to_string();
        }
        let id = entry.id.clone();
        self.entries.write().await.push(entry);
        Ok(id)
    }

    async fn search(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>, MemoryError> {
        let entries = self.entries.read().await;

        let mut results: Vec<MemoryEntry> = entries
            .iter()
            .filter(|e| query.tags.is_empty() || query.tags.iter().any(|t| e.tags.contains(t)))
            .map(|e| {
                let mut hit = e.clone();
                hit.score = keyword_score(&query.text, &e.content);
                hit
            })
            .filter(|e| e.score > 0.0 && e.score >= query.min_score)
            .collect();

        // Best score first, newest first among ties.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        results.truncate(query.limit);

        tracing::debug!(query = %query.text, hits = results.len(), "Memory search");
        Ok(results)
    }

    async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let mut entries = self.entries.write().await;
        let len_before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < len_before)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.entries.read().await.len())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helloagents_core::memory::TASK_STATE_TAG;

    #[tokio::test]
    async fn store_and_retrieve() {
        let mem = InMemoryBackend::new();
        let id = mem.store(MemoryEntry::new("Rust is a systems language")).await.unwrap();
        assert!(!id.is_empty());

        let entry = mem.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.content, "Rust is a systems language");
    }

    #[tokio::test]
    async fn search_ranks_by_term_overlap() {
        let mem = InMemoryBackend::new();
        mem.store(MemoryEntry::new("Rust parser for ReAct output")).await.unwrap();
        mem.store(MemoryEntry::new("Python scripting notes")).await.unwrap();
        mem.store(MemoryEntry::new("The parser drops markdown")).await.unwrap();

        let results = mem.search(MemoryQuery::new("rust parser")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].content.starts_with("Rust parser"));
        assert_eq!(results[0].score, 1.0);
        assert_eq!(results[1].score, 0.5);
    }

    #[tokio::test]
    async fn empty_query_with_tag_lists_tagged_entries() {
        let mem = InMemoryBackend::new();
        mem.store(MemoryEntry::new("subgoal: fix parser").with_tag(TASK_STATE_TAG)).await.unwrap();
        mem.store(MemoryEntry::new("unrelated fact")).await.unwrap();

        let results = mem
            .search(MemoryQuery::new("").with_tag(TASK_STATE_TAG))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("fix parser"));
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let mem = InMemoryBackend::new();
        let id = mem.store(MemoryEntry::new("To be deleted")).await.unwrap();
        mem.store(MemoryEntry::new("Stays")).await.unwrap();
        assert!(mem.delete(&id).await.unwrap());
        assert!(!mem.delete(&id).await.unwrap());
        assert_eq!(mem.count().await.unwrap(), 1);

        mem.clear().await.unwrap();
        assert_eq!(mem.count().await.unwrap(), 0);
    }
}
