//! Memory and knowledge backends for HelloAgents.
//!
//! Both backends score with the same keyword overlap: the share of query
//! terms that occur in the content.

pub mod in_memory;
pub mod knowledge;

pub use in_memory::InMemoryBackend;
pub use knowledge::StaticKnowledgeBase;

/// Lowercased terms of `text`, split on anything that is not alphanumeric.
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query terms contained in `content`, in `[0, 1]`.
/// An empty query scores every content as `1.0`.
pub fn keyword_score(query: &str, content: &str) -> f32 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 1.0;
    }
    let haystack = content.to_lowercase();
    let hits = query_terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / query_terms.len() as f32
}
