//! Context packets: the candidate units the builder selects from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a packet came from, which decides its section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Instructions,
    History,
    ToolSummary,
    PendingState,
    TaskState,
    RelatedMemory,
    KnowledgeBase,
    Retrieval,
    ToolResult,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instructions => "instructions",
            Self::History => "history",
            Self::ToolSummary => "tool_summary",
            Self::PendingState => "pending_state",
            Self::TaskState => "task_state",
            Self::RelatedMemory => "related_memory",
            Self::KnowledgeBase => "knowledge_base",
            Self::Retrieval => "retrieval",
            Self::ToolResult => "tool_result",
        }
    }

    /// Mandatory packets skip scoring and are always selected.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::Instructions | Self::History)
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPacket {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PacketKind,
    /// Free-form extras (`source`, `count`, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Filled in by the builder's counter when zero.
    #[serde(default)]
    pub token_count: usize,
    /// Query-term overlap in `[0, 1]`, computed during selection.
    #[serde(default)]
    pub relevance_score: f64,
}

impl ContextPacket {
    pub fn new(kind: PacketKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
            kind,
            metadata: Map::new(),
            token_count: 0,
            relevance_score: 0.0,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_kinds() {
        assert!(PacketKind::Instructions.is_mandatory());
        assert!(PacketKind::History.is_mandatory());
        assert!(!PacketKind::Retrieval.is_mandatory());
        assert!(!PacketKind::ToolSummary.is_mandatory());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let packet = ContextPacket::new(PacketKind::KnowledgeBase, "x").with_metadata("source", "a.md");
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["kind"], "knowledge_base");
        assert_eq!(json["metadata"]["source"], "a.md");
    }
}
