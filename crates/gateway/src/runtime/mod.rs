//! Agent runtime — the deterministic loop that turns one user message into
//! LLM calls, tool dispatches, and an ordered list of message drafts.

pub mod history;
pub mod prompt;
pub mod tools;
pub mod turn;

pub use turn::{ToolActivity, TurnInput, TurnOutcome, TurnRunner};
