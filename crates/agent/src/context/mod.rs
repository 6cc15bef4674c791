//! Prompt context assembly under a token budget.
//!
//! | Section | Packets | Kept when over budget |
//! |---------|---------|-----------------------|
//! | `[Role & Policies]` | instructions | always |
//! | `[Task]` | the user query | always |
//! | `[State]` | task state, pending state | by score |
//! | `[Evidence]` | retrieval, memory, knowledge, tool results/summaries | by score |
//! | `[Recent Conversation]` / `[Context]` | history | always |
//! | `[Output]` | fixed answer template | optional |

pub mod builder;
pub mod packet;
pub mod token;

pub use builder::{BuiltContext, Compression, ContextBuilder, ContextInput, ContextReport, DropInfo};
pub use packet::{ContextPacket, PacketKind};
pub use token::{HeuristicCounter, TokenCounter, counter_for};
#[cfg(feature = "bpe")]
pub use token::BpeCounter;
