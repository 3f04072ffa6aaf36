//! Provider adapters and the normalized `LlmClient` contract (spec C2).

pub mod anthropic;
pub mod client;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use client::{
    AnthropicClient, AttemptSink, FallbackClient, FinishReason, LlmClient, LlmResponse,
    DEFAULT_THINKING_END, DEFAULT_THINKING_START,
};
pub use provider::LlmProvider;
pub use types::*;
