//! The HelloAgents execution core.
//!
//! A [`ReactAgent`] drives the **Thought → Action → Observation** cycle:
//!
//! 1. **Build the task prompt** (plain task, or base context from a
//!    [`ContextBuilder`] over earlier turns)
//! 2. **Ask the LLM** for one `Thought:` / `Action:` pair
//! 3. **Parse** it leniently, asking once for a strict rewrite if needed
//! 4. **Dispatch** `tool[input]` through the shared `ToolRegistry`
//! 5. **Observe**: append the (possibly summarized) output to the trace
//!
//! The cycle ends at `Finish[...]` or at one of the guard rails (step cap,
//! repeated action, empty or unparseable reply, cancellation), after which a
//! finalize call turns the trace into a best-effort answer.

pub mod context;
pub mod parser;
pub mod react;
pub mod summarizer;
pub mod trace;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

pub use context::{
    BuiltContext, Compression, ContextBuilder, ContextInput, ContextPacket, ContextReport, DropInfo,
    PacketKind, TokenCounter,
};
pub use parser::{ParsedOutput, format_output, parse_action, parse_finish, parse_output};
pub use react::{APOLOGY, DEFAULT_REACT_PROMPT, ReactAgent, ReactOutcome, Termination};
pub use summarizer::{LlmSummarizer, ObservationSummarizer};
pub use trace::{TraceEntry, render_history};
