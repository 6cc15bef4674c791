//! Gather → Select → Structure → Compress context pipeline.
//!
//! Produces one sectioned prompt that fits in
//! `floor(max_tokens * (1 - reserve_ratio))` tokens:
//!
//! 1. **Gather** instructions, recent history, tool summaries and pending
//!    state. With `lazy_fetch = false` also task state and related memory
//!    from the memory backend, and snippets from the retriever.
//! 2. **Select**: instructions and history are always kept. Everything else
//!    scores `0.7 * relevance + 0.3 * recency`, is dropped below
//!    `min_relevance`, and fills the remaining budget greedily (MMR order
//!    when enabled).
//! 3. **Structure** into fixed sections, omitting empty ones.
//! 4. **Compress** when still over budget: LLM first, if configured, then
//!    line truncation from the end that keeps every section header.
//!
//! [`build_base`](ContextBuilder::build_base) is the lazy-fetch shape the
//! agent uses each turn: no scoring, shorter section list.

use crate::context::packet::{ContextPacket, PacketKind};
use crate::context::token::{TokenCounter, counter_for};
use chrono::{DateTime, Utc};
use helloagents_config::ContextConfig;
use helloagents_core::llm::{InvokeOptions, LlmClient};
use helloagents_core::memory::{MemoryBackend, MemoryQuery, Retriever, TASK_STATE_TAG};
use helloagents_core::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Everything one build reads. Borrowed; the builder never mutates it.
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub user_query: &'a str,
    pub history: &'a [Message],
    pub system_instructions: Option<&'a str>,
    /// One line per earlier tool call; only the last three are used.
    pub tool_summaries: &'a [String],
    pub pending_state: Option<&'a str>,
    /// Caller-supplied candidates (tool results, retrieval hits, ...).
    pub packets: &'a [ContextPacket],
}

impl<'a> ContextInput<'a> {
    pub fn new(user_query: &'a str) -> Self {
        Self {
            user_query,
            history: &[],
            system_instructions: None,
            tool_summaries: &[],
            pending_state: None,
            packets: &[],
        }
    }

    pub fn with_history(mut self, history: &'a [Message]) -> Self {
        self.history = history;
        self
    }

    pub fn with_instructions(mut self, instructions: &'a str) -> Self {
        self.system_instructions = Some(instructions);
        self
    }

    pub fn with_tool_summaries(mut self, summaries: &'a [String]) -> Self {
        self.tool_summaries = summaries;
        self
    }

    pub fn with_pending_state(mut self, state: &'a str) -> Self {
        self.pending_state = Some(state);
        self
    }

    pub fn with_packets(mut self, packets: &'a [ContextPacket]) -> Self {
        self.packets = packets;
        self
    }
}

/// How the final text was brought under budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Llm,
    Truncated,
}

/// A packet left out during selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub kind: PacketKind,
    pub tokens: usize,
    pub reason: String,
}

impl DropInfo {
    fn new(packet: &ContextPacket, reason: &str) -> Self {
        Self {
            kind: packet.kind,
            tokens: packet.token_count,
            reason: reason.to_string(),
        }
    }
}

/// What a build did, for logging and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextReport {
    pub total_tokens: usize,
    pub budget: usize,
    pub packets_gathered: usize,
    pub packets_selected: usize,
    pub drops: Vec<DropInfo>,
    pub compression: Compression,
}

#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub text: String,
    pub report: ContextReport,
}

const SECTION_HEADERS: &[&str] = &[
    "[Role & Policies]",
    "[Task]",
    "[State]",
    "[Evidence]",
    "[Recent Conversation]",
    "[Context]",
    "[Output]",
];

const OUTPUT_SECTION: &str = "[Output]\n请按以下格式回答：\n\
- 结论：简洁明确\n\
- 依据：支撑证据及来源\n\
- 风险与假设：如有\n\
- 下一步：建议的最小行动";

const COMPRESS_PROMPT: &str = "You compress agent context to fit a token budget. \
Keep every section header ([Role & Policies], [Task], [State], [Evidence], [Context], \
[Recent Conversation], [Output]) and the user's goal verbatim. Trim [Evidence] and \
[Context] aggressively but keep file paths, commands, errors and conclusions. \
Never invent content. Reply with the compressed context only.";

const MAX_TOOL_SUMMARIES: usize = 3;
const EAGER_LIMIT: usize = 5;
const RECENCY_TAU_SECS: f64 = 3600.0;

// ── Builder ───────────────────────────────────────────────────────────────

/// Stateless apart from its collaborators; build as often as needed.
pub struct ContextBuilder {
    config: ContextConfig,
    counter: Arc<dyn TokenCounter>,
    memory: Option<Arc<dyn MemoryBackend>>,
    retriever: Option<Arc<dyn Retriever>>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        let counter = counter_for(&config);
        Self {
            config,
            counter,
            memory: None,
            retriever: None,
            llm: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Memory backend queried in eager mode.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Retriever queried in eager mode.
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// LLM used to compress over-budget context.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Full pipeline.
    pub async fn build(&self, input: &ContextInput<'_>) -> String {
        self.build_with_report(input).await.text
    }

    pub async fn build_with_report(&self, input: &ContextInput<'_>) -> BuiltContext {
        let packets = self.gather(input).await;
        let gathered = packets.len();
        let (selected, drops) = self.select(packets, input.user_query);
        let structured = self.structure(&selected, input.user_query);
        let (text, compression) = self.compress(structured).await;

        let report = ContextReport {
            total_tokens: self.counter.count(&text),
            budget: self.config.available_tokens(),
            packets_gathered: gathered,
            packets_selected: selected.len(),
            drops,
            compression,
        };
        debug!(
            tokens = report.total_tokens,
            budget = report.budget,
            selected = report.packets_selected,
            dropped = report.drops.len(),
            "Context built"
        );
        BuiltContext { text, report }
    }

    /// Base context: instructions, recent history, last tool summaries and
    /// pending state, all kept. Memory and retrieval are left to the
    /// `context_fetch` tool.
    pub async fn build_base(&self, input: &ContextInput<'_>) -> String {
        self.build_base_with_report(input).await.text
    }

    pub async fn build_base_with_report(&self, input: &ContextInput<'_>) -> BuiltContext {
        let packets = self.base_packets(input);
        let structured = self.structure_base(&packets, input.user_query);
        let (text, compression) = self.compress(structured).await;

        let report = ContextReport {
            total_tokens: self.counter.count(&text),
            budget: self.config.available_tokens(),
            packets_gathered: packets.len(),
            packets_selected: packets.len(),
            drops: Vec::new(),
            compression,
        };
        BuiltContext { text, report }
    }

    // ── Gather ────────────────────────────────────────────────────────────

    fn base_packets(&self, input: &ContextInput<'_>) -> Vec<ContextPacket> {
        let mut packets = Vec::new();

        if let Some(instructions) = input.system_instructions.filter(|s| !s.trim().is_empty()) {
            packets.push(ContextPacket::new(PacketKind::Instructions, instructions));
        }

        let start = input.history.len().saturating_sub(self.config.max_history_turns);
        let recent = &input.history[start..];
        if !recent.is_empty() {
            let text = recent
                .iter()
                .map(|m| format!("[{}] {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n");
            packets.push(
                ContextPacket::new(PacketKind::History, text).with_metadata("count", recent.len()),
            );
        }

        let start = input.tool_summaries.len().saturating_sub(MAX_TOOL_SUMMARIES);
        let summaries = &input.tool_summaries[start..];
        if !summaries.is_empty() {
            packets.push(ContextPacket::new(PacketKind::ToolSummary, summaries.join("\n")));
        }

        if let Some(state) = input.pending_state.filter(|s| !s.trim().is_empty()) {
            packets.push(ContextPacket::new(PacketKind::PendingState, state));
        }

        self.count_all(packets)
    }

    async fn gather(&self, input: &ContextInput<'_>) -> Vec<ContextPacket> {
        let mut packets = self.base_packets(input);
        if !self.config.lazy_fetch {
            packets.extend(self.eager_packets(input.user_query).await);
        }
        packets.extend(input.packets.iter().cloned());
        self.count_all(packets)
    }

    async fn eager_packets(&self, query: &str) -> Vec<ContextPacket> {
        let mut packets = Vec::new();

        if let Some(memory) = &self.memory {
            let state = memory
                .search(MemoryQuery::new("").with_tag(TASK_STATE_TAG).with_limit(EAGER_LIMIT))
                .await;
            let state = match state {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "task state lookup failed");
                    Vec::new()
                }
            };
            let state_ids: HashSet<String> = state.iter().map(|e| e.id.clone()).collect();
            packets.extend(state.into_iter().map(|e| {
                ContextPacket::new(PacketKind::TaskState, e.content)
                    .at(e.created_at)
                    .with_metadata("id", e.id)
            }));

            match memory.search(MemoryQuery::new(query).with_limit(EAGER_LIMIT)).await {
                Ok(entries) => packets.extend(
                    entries
                        .into_iter()
                        .filter(|e| !state_ids.contains(&e.id))
                        .map(|e| {
                            ContextPacket::new(PacketKind::RelatedMemory, e.content)
                                .at(e.created_at)
                                .with_metadata("id", e.id)
                        }),
                ),
                Err(e) => warn!(error = %e, "memory lookup failed"),
            }
        }

        if let Some(retriever) = &self.retriever {
            match retriever.retrieve(query, EAGER_LIMIT).await {
                Ok(chunks) => packets.extend(chunks.into_iter().map(|c| {
                    ContextPacket::new(PacketKind::KnowledgeBase, c.content)
                        .with_metadata("source", c.source)
                })),
                Err(e) => warn!(retriever = %retriever.name(), error = %e, "retrieval failed"),
            }
        }

        packets
    }

    fn count_all(&self, mut packets: Vec<ContextPacket>) -> Vec<ContextPacket> {
        for p in &mut packets {
            if p.token_count == 0 {
                p.token_count = self.counter.count(&p.content);
            }
        }
        packets
    }

    // ── Select ────────────────────────────────────────────────────────────

    fn select(
        &self,
        packets: Vec<ContextPacket>,
        query: &str,
    ) -> (Vec<ContextPacket>, Vec<DropInfo>) {
        let query_terms = term_set(query);
        let now = Utc::now();
        let budget = self.config.available_tokens();

        let mut selected = Vec::new();
        let mut candidates = Vec::new();
        let mut drops = Vec::new();

        for mut packet in packets {
            packet.relevance_score = relevance(&query_terms, &packet.content);
            if packet.kind.is_mandatory() {
                selected.push(packet);
            } else if packet.relevance_score < self.config.min_relevance {
                drops.push(DropInfo::new(&packet, "below min_relevance"));
            } else {
                let score = 0.7 * packet.relevance_score + 0.3 * recency(now, packet.timestamp);
                candidates.push((score, packet));
            }
        }

        let ordered = if self.config.enable_mmr {
            mmr_order(candidates, self.config.mmr_lambda)
        } else {
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.into_iter().map(|(_, p)| p).collect()
        };

        let mut used: usize = selected.iter().map(|p| p.token_count).sum();
        let mut rest = ordered.into_iter();
        for packet in rest.by_ref() {
            if used + packet.token_count > budget {
                drops.push(DropInfo::new(&packet, "over budget"));
                break;
            }
            used += packet.token_count;
            selected.push(packet);
        }
        drops.extend(rest.map(|p| DropInfo::new(&p, "over budget")));

        (selected, drops)
    }

    // ── Structure ─────────────────────────────────────────────────────────

    fn structure(&self, selected: &[ContextPacket], query: &str) -> String {
        let mut sections = Vec::new();
        push_section(&mut sections, "[Role & Policies]", selected, &[PacketKind::Instructions]);
        sections.push(format!("[Task]\n{query}"));
        push_section(
            &mut sections,
            "[State]",
            selected,
            &[PacketKind::TaskState, PacketKind::PendingState],
        );
        push_section(
            &mut sections,
            "[Evidence]",
            selected,
            &[
                PacketKind::Retrieval,
                PacketKind::RelatedMemory,
                PacketKind::KnowledgeBase,
                PacketKind::ToolResult,
                PacketKind::ToolSummary,
            ],
        );
        push_section(&mut sections, "[Recent Conversation]", selected, &[PacketKind::History]);
        if self.config.include_output_format {
            sections.push(OUTPUT_SECTION.to_string());
        }
        sections.join("\n\n")
    }

    fn structure_base(&self, packets: &[ContextPacket], query: &str) -> String {
        let mut sections = Vec::new();
        push_section(&mut sections, "[Role & Policies]", packets, &[PacketKind::Instructions]);
        push_section(&mut sections, "[Context]", packets, &[PacketKind::History]);
        push_section(&mut sections, "[Evidence]", packets, &[PacketKind::ToolSummary]);
        push_section(&mut sections, "[State]", packets, &[PacketKind::PendingState]);
        sections.push(format!("[Task]\n{query}"));
        sections.join("\n\n")
    }

    // ── Compress ──────────────────────────────────────────────────────────

    async fn compress(&self, text: String) -> (String, Compression) {
        if !self.config.enable_compression {
            return (text, Compression::None);
        }
        let budget = self.config.available_tokens();
        let tokens = self.counter.count(&text);
        if tokens <= budget {
            return (text, Compression::None);
        }

        if let Some(llm) = &self.llm {
            if let Some(compressed) = self.compress_with_llm(llm.as_ref(), &text, budget).await {
                return (compressed, Compression::Llm);
            }
            warn!("LLM compression unusable, falling back to truncation");
        }

        warn!(tokens, budget, "Context over budget, truncating");
        (self.truncate(&text, budget), Compression::Truncated)
    }

    async fn compress_with_llm(&self, llm: &dyn LlmClient, text: &str, budget: usize) -> Option<String> {
        let messages = [
            Message::system(COMPRESS_PROMPT),
            Message::user(format!(
                "Target budget (approx): {budget} tokens\n\nOriginal context:\n{text}"
            )),
        ];
        let max_tokens = (self.config.max_tokens as f64 * 0.4).min(1200.0) as u32;
        let options = InvokeOptions::default().with_max_tokens(max_tokens.max(1));

        match llm.invoke(&messages, &options).await {
            Ok(Some(out)) => {
                let out = out.trim();
                (!out.is_empty() && self.counter.count(out) <= budget).then(|| out.to_string())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "context compression call failed");
                None
            }
        }
    }

    /// Drop lines from the end until within budget. Body lines go first so
    /// every section header survives as long as possible.
    ///
    /// The drop order is fixed up front, so the smallest number of drops
    /// that fits is found by bisection instead of recounting after each one.
    fn truncate(&self, text: &str, budget: usize) -> String {
        let lines: Vec<&str> = text.lines().collect();
        let (headers, body): (Vec<usize>, Vec<usize>) =
            (0..lines.len()).rev().partition(|&i| is_header(lines[i]));
        let order: Vec<usize> = body.into_iter().chain(headers).collect();

        let keep = |dropped: usize| {
            let mut gone = vec![false; lines.len()];
            for &i in &order[..dropped] {
                gone[i] = true;
            }
            lines
                .iter()
                .zip(&gone)
                .filter(|(_, gone)| !**gone)
                .map(|(line, _)| *line)
                .collect::<Vec<_>>()
                .join("\n")
        };

        let (mut lo, mut hi) = (0, order.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.counter.count(&keep(mid)) <= budget {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        keep(lo)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn push_section(
    sections: &mut Vec<String>,
    header: &str,
    packets: &[ContextPacket],
    kinds: &[PacketKind],
) {
    let body: Vec<&str> = packets
        .iter()
        .filter(|p| kinds.contains(&p.kind))
        .map(|p| p.content.as_str())
        .collect();
    if !body.is_empty() {
        sections.push(format!("{header}\n{}", body.join("\n")));
    }
}

fn is_header(line: &str) -> bool {
    SECTION_HEADERS.contains(&line.trim())
}

fn term_set(text: &str) -> HashSet<String> {
    helloagents_memory::terms(text).into_iter().collect()
}

/// Share of query terms present in the content.
fn relevance(query_terms: &HashSet<String>, content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = term_set(content);
    query_terms.intersection(&content_terms).count() as f64 / query_terms.len() as f64
}

fn recency(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> f64 {
    let delta = (now - timestamp).num_milliseconds().max(0) as f64 / 1000.0;
    (-delta / RECENCY_TAU_SECS).exp()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Maximal marginal relevance: repeatedly take the candidate maximizing
/// `λ·score − (1−λ)·max_jaccard(candidate, chosen)`.
fn mmr_order(candidates: Vec<(f64, ContextPacket)>, lambda: f64) -> Vec<ContextPacket> {
    let mut pool: Vec<(f64, HashSet<String>, ContextPacket)> = candidates
        .into_iter()
        .map(|(score, p)| (score, term_set(&p.content), p))
        .collect();
    let mut chosen: Vec<HashSet<String>> = Vec::new();
    let mut ordered = Vec::with_capacity(pool.len());

    while !pool.is_empty() {
        let best = pool
            .iter()
            .enumerate()
            .map(|(i, (score, terms, _))| {
                let similarity = chosen.iter().map(|c| jaccard(terms, c)).fold(0.0, f64::max);
                (i, lambda * score - (1.0 - lambda) * similarity)
            })
            .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
            .map_or(0, |(i, _)| i);
        let (_, terms, packet) = pool.remove(best);
        chosen.push(terms);
        ordered.push(packet);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token::HeuristicCounter;
    use crate::test_helpers::ScriptedLlm;
    use helloagents_core::memory::MemoryEntry;
    use helloagents_memory::{InMemoryBackend, StaticKnowledgeBase};

    fn config() -> ContextConfig {
        ContextConfig::default()
    }

    fn builder(config: ContextConfig) -> ContextBuilder {
        ContextBuilder::new(config).with_counter(Arc::new(HeuristicCounter))
    }

    fn history(n: usize, chars: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let body = format!("{i}{}", "x".repeat(chars - 1));
                if i % 2 == 0 { Message::user(body) } else { Message::assistant(body) }
            })
            .collect()
    }

    #[test]
    fn available_tokens_floor() {
        let cfg = ContextConfig {
            max_tokens: 200,
            reserve_ratio: 0.1,
            ..config()
        };
        assert_eq!(cfg.available_tokens(), 180);
    }

    #[tokio::test]
    async fn base_context_shape() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let summaries = vec!["terminal[ls] → 3 files".to_string()];
        let input = ContextInput::new("list the files")
            .with_instructions("Be careful.")
            .with_history(&history)
            .with_tool_summaries(&summaries)
            .with_pending_state("patch awaiting approval");

        let text = builder(config()).build_base(&input).await;
        assert_eq!(
            text,
            "[Role & Policies]\nBe careful.\n\n\
             [Context]\n[user] hi\n[assistant] hello\n\n\
             [Evidence]\nterminal[ls] → 3 files\n\n\
             [State]\npatch awaiting approval\n\n\
             [Task]\nlist the files"
        );
    }

    #[tokio::test]
    async fn base_context_omits_empty_sections() {
        let text = builder(config()).build_base(&ContextInput::new("q")).await;
        assert_eq!(text, "[Task]\nq");
    }

    #[tokio::test]
    async fn base_keeps_last_three_summaries_and_history_window() {
        let summaries: Vec<String> = (0..5).map(|i| format!("s{i}")).collect();
        let history = history(12, 5);
        let cfg = ContextConfig {
            max_history_turns: 2,
            ..config()
        };
        let input = ContextInput::new("q")
            .with_tool_summaries(&summaries)
            .with_history(&history);
        let built = builder(cfg).build_base_with_report(&input).await;
        assert!(built.text.contains("[Evidence]\ns2\ns3\ns4"));
        assert!(!built.text.contains("s1"));
        assert_eq!(built.text.matches("xxxx").count(), 2);
        assert_eq!(built.report.packets_selected, 2);
    }

    #[tokio::test]
    async fn full_build_section_order() {
        let history = vec![Message::user("earlier question")];
        let packets = vec![ContextPacket::new(
            PacketKind::ToolResult,
            "the tokio runtime schedule tasks with work stealing",
        )];
        let input = ContextInput::new("how does the tokio runtime schedule tasks")
            .with_instructions("You are a Rust expert.")
            .with_history(&history)
            .with_pending_state("tokio runtime schedule tasks: investigation in progress")
            .with_packets(&packets);

        let text = builder(config()).build(&input).await;
        let order: Vec<usize> = [
            "[Role & Policies]",
            "[Task]",
            "[State]",
            "[Evidence]",
            "[Recent Conversation]",
            "[Output]",
        ]
        .iter()
        .map(|h| text.find(h).unwrap_or_else(|| panic!("missing {h}")))
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("[Recent Conversation]\n[user] earlier question"));
        assert!(text.contains("[Task]\nhow does the tokio runtime schedule tasks"));
    }

    #[tokio::test]
    async fn output_section_is_optional() {
        let cfg = ContextConfig {
            include_output_format: false,
            ..config()
        };
        let text = builder(cfg).build(&ContextInput::new("q")).await;
        assert_eq!(text, "[Task]\nq");
    }

    #[tokio::test]
    async fn eager_mode_queries_memory_and_retriever() {
        let memory = Arc::new(InMemoryBackend::new());
        memory
            .store(MemoryEntry::new("subgoal: parser done, loop pending").with_tag(TASK_STATE_TAG))
            .await
            .unwrap();
        memory.store(MemoryEntry::new("the parser handles full-width colons")).await.unwrap();
        let kb = StaticKnowledgeBase::new().with_chunk("guide.md", "parser accepts Chinese labels");

        let cfg = ContextConfig {
            lazy_fetch: false,
            min_relevance: 0.0,
            ..config()
        };
        let builder = builder(cfg)
            .with_memory(memory)
            .with_retriever(Arc::new(kb));

        let built = builder.build_with_report(&ContextInput::new("parser")).await;
        assert_eq!(built.report.packets_gathered, 3);
        assert!(built.text.contains("[State]\nsubgoal: parser done, loop pending"));
        assert!(built.text.contains("the parser handles full-width colons"));
        assert!(built.text.contains("parser accepts Chinese labels"));
        assert_eq!(built.text.matches("subgoal").count(), 1);
    }

    #[tokio::test]
    async fn lazy_mode_skips_memory() {
        let memory = Arc::new(InMemoryBackend::new());
        memory.store(MemoryEntry::new("parser fact")).await.unwrap();
        let built = builder(config())
            .with_memory(memory)
            .build_with_report(&ContextInput::new("parser"))
            .await;
        assert_eq!(built.report.packets_gathered, 0);
        assert!(!built.text.contains("parser fact"));
    }

    #[tokio::test]
    async fn low_relevance_packets_are_dropped() {
        let packets = vec![
            ContextPacket::new(PacketKind::Retrieval, "tokio scheduler internals"),
            ContextPacket::new(PacketKind::Retrieval, "unrelated cooking recipe"),
        ];
        let built = builder(config())
            .build_with_report(&ContextInput::new("tokio scheduler").with_packets(&packets))
            .await;
        assert!(built.text.contains("tokio scheduler internals"));
        assert!(!built.text.contains("cooking"));
        assert_eq!(built.report.drops.len(), 1);
        assert_eq!(built.report.drops[0].reason, "below min_relevance");
    }

    #[tokio::test]
    async fn mandatory_packets_ignore_relevance() {
        let history = vec![Message::user("completely different topic")];
        let text = builder(config())
            .build(
                &ContextInput::new("tokio")
                    .with_instructions("zzz")
                    .with_history(&history),
            )
            .await;
        assert!(text.contains("[Role & Policies]\nzzz"));
        assert!(text.contains("completely different topic"));
    }

    #[tokio::test]
    async fn greedy_fill_stops_at_first_packet_that_does_not_fit() {
        let cfg = ContextConfig {
            max_tokens: 100,
            reserve_ratio: 0.0,
            enable_mmr: false,
            enable_compression: false,
            include_output_format: false,
            ..config()
        };
        let ts = Utc::now();
        let packets = vec![
            ContextPacket::new(PacketKind::Retrieval, format!("tokio {}", "a".repeat(200))).at(ts),
            ContextPacket::new(PacketKind::Retrieval, format!("tokio {}", "b".repeat(300))).at(ts),
            ContextPacket::new(PacketKind::Retrieval, "tokio small").at(ts),
        ];
        let built = builder(cfg)
            .build_with_report(&ContextInput::new("tokio").with_packets(&packets))
            .await;
        // equal scores keep input order: a fits (52), b does not (77), c is never tried
        assert!(built.text.contains("aaaa"));
        assert!(!built.text.contains("bbbb"));
        assert!(!built.text.contains("tokio small"));
        assert_eq!(built.report.drops.len(), 2);
        assert!(built.report.drops.iter().all(|d| d.reason == "over budget"));
    }

    #[tokio::test]
    async fn mmr_prefers_diverse_evidence() {
        let ts = Utc::now() - chrono::Duration::minutes(1);
        let packets = vec![
            ContextPacket::new(PacketKind::Retrieval, "rust async runtime tokio").at(ts),
            ContextPacket::new(PacketKind::Retrieval, "tokio rust async runtime").at(ts),
            ContextPacket::new(PacketKind::Retrieval, "async runtime smol docs").at(ts),
        ];
        let input = ContextInput::new("rust async runtime").with_packets(&packets);

        let with_mmr = builder(config()).build(&input).await;
        assert!(with_mmr.find("smol").unwrap() < with_mmr.find("tokio rust").unwrap());

        let cfg = ContextConfig {
            enable_mmr: false,
            ..config()
        };
        let without = builder(cfg).build(&input).await;
        assert!(without.find("tokio rust").unwrap() < without.find("smol").unwrap());
    }

    #[tokio::test]
    async fn budget_compression_keeps_headers() {
        let cfg = ContextConfig {
            max_tokens: 200,
            reserve_ratio: 0.1,
            ..config()
        };
        // 5 messages of ~100 tokens each
        let history = history(5, 400);
        let b = builder(cfg);
        let built = b
            .build_with_report(
                &ContextInput::new("summarize our chat")
                    .with_instructions("You are concise.")
                    .with_history(&history),
            )
            .await;

        assert!(b.count_tokens(&built.text) <= 180);
        assert!(built.text.contains("[Role & Policies]"));
        assert!(built.text.contains("[Task]"));
        assert!(built.text.contains("[Recent Conversation]"));
        assert_eq!(built.report.compression, Compression::Truncated);
        assert!(built.report.total_tokens <= built.report.budget);
    }

    #[tokio::test]
    async fn budget_holds_for_any_history_size() {
        let cfg = ContextConfig {
            max_tokens: 300,
            reserve_ratio: 0.2,
            ..config()
        };
        let b = builder(cfg);
        for n in [0, 1, 3, 10, 40] {
            let history = history(n, 120);
            let input = ContextInput::new("q").with_instructions("rules").with_history(&history);
            assert!(b.count_tokens(&b.build(&input).await) <= 240);
            assert!(b.count_tokens(&b.build_base(&input).await) <= 240);
        }
    }

    #[tokio::test]
    async fn llm_compression_used_when_within_budget() {
        let llm = Arc::new(ScriptedLlm::new(["[Role & Policies]\nbe concise\n\n[Task]\nshort"]));
        let cfg = ContextConfig {
            max_tokens: 200,
            reserve_ratio: 0.1,
            ..config()
        };
        let history = history(5, 400);
        let built = builder(cfg)
            .with_llm(llm.clone())
            .build_with_report(&ContextInput::new("short").with_history(&history))
            .await;
        assert_eq!(built.report.compression, Compression::Llm);
        assert!(built.text.starts_with("[Role & Policies]"));
        let requests = llm.requests();
        assert!(requests[0].messages[1].content.starts_with("Target budget (approx): 180 tokens"));
        assert_eq!(requests[0].options.max_tokens, Some(80));
    }

    #[tokio::test]
    async fn oversized_llm_compression_falls_back_to_truncation() {
        let llm = Arc::new(ScriptedLlm::new(["y".repeat(2000)]));
        let cfg = ContextConfig {
            max_tokens: 200,
            reserve_ratio: 0.1,
            ..config()
        };
        let history = history(5, 400);
        let b = builder(cfg).with_llm(llm);
        let built = b
            .build_with_report(&ContextInput::new("short").with_history(&history))
            .await;
        assert_eq!(built.report.compression, Compression::Truncated);
        assert!(b.count_tokens(&built.text) <= 180);
    }

    #[tokio::test]
    async fn compression_disabled_returns_text_as_is() {
        let cfg = ContextConfig {
            max_tokens: 50,
            reserve_ratio: 0.0,
            enable_compression: false,
            ..config()
        };
        let history = history(3, 400);
        let built = builder(cfg)
            .build_with_report(&ContextInput::new("q").with_history(&history))
            .await;
        assert_eq!(built.report.compression, Compression::None);
        assert!(built.report.total_tokens > 50);
    }

    /// Recounts after every dropped line.
    fn drop_one_at_a_time(counter: &dyn TokenCounter, text: &str, budget: usize) -> String {
        let mut lines: Vec<&str> = text.lines().collect();
        while !lines.is_empty() && counter.count(&lines.join("\n")) > budget {
            match lines.iter().rposition(|line| !is_header(line)) {
                Some(idx) => {
                    lines.remove(idx);
                }
                None => {
                    lines.pop();
                }
            }
        }
        lines.join("\n")
    }

    #[test]
    fn truncate_drops_the_fewest_lines() {
        let b = builder(config());
        let text = (0..120)
            .map(|i| match i % 25 {
                0 => "[Evidence]".to_string(),
                7 => "[Task]".to_string(),
                _ => format!("line {i} {}", "y".repeat(i % 13)),
            })
            .collect::<Vec<_>>()
            .join("\n");
        for budget in [0, 3, 10, 40, 95, 160, 400, 10_000] {
            assert_eq!(
                b.truncate(&text, budget),
                drop_one_at_a_time(&HeuristicCounter, &text, budget),
                "budget {budget}"
            );
        }
    }

    #[test]
    fn truncate_scales_to_long_histories() {
        let b = builder(config());
        let mut text = String::from("[Role & Policies]\nbe brief\n[Recent Conversation]");
        for i in 0..20_000 {
            text.push_str(&format!("\n[user] message number {i}"));
        }
        text.push_str("\n[Task]\nsummarize");

        let out = b.truncate(&text, 300);

        assert!(HeuristicCounter.count(&out) <= 300);
        assert!(out.starts_with("[Role & Policies]\nbe brief\n[Recent Conversation]\n[user] message number 0\n"));
        assert!(out.ends_with("\n[Task]"));
        let kept = out.lines().filter(|l| l.starts_with("[user]")).count();
        assert!(kept > 10);
        let one_more = out.replacen("\n[Task]", &format!("\n[user] message number {kept}\n[Task]"), 1);
        assert!(HeuristicCounter.count(&one_more) > 300);
    }

    #[test]
    fn relevance_and_jaccard() {
        let q = term_set("Rust async runtime");
        assert!((relevance(&q, "an ASYNC runtime") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(relevance(&HashSet::new(), "anything"), 0.0);
        assert_eq!(jaccard(&term_set("a b"), &term_set("b c")), 1.0 / 3.0);
    }

    #[test]
    fn recency_decays_hourly() {
        let now = Utc::now();
        assert!((recency(now, now) - 1.0).abs() < 1e-9);
        let hour_ago = now - chrono::Duration::hours(1);
        assert!((recency(now, hour_ago) - (-1.0f64).exp()).abs() < 1e-6);
        assert_eq!(recency(now, now + chrono::Duration::hours(1)), 1.0);
    }
}
