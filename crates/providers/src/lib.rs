//! LLM provider adapters.
//!
//! One trait ([`LlmProvider`]) and one production adapter
//! ([`OpenAiCompatProvider`]) speaking the OpenAI chat-completions wire
//! format with tool calling. The agent loop depends only on the trait, so
//! tests substitute scripted providers.

mod openai_compat;
mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider, Usage};
