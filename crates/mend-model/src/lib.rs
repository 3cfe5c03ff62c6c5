//! The only path to the external model: a provider seam plus a client that
//! routes every call through the circuit breaker and records a usage row
//! for every outcome.

mod client;
mod parse;
mod provider;

pub use client::{CallOptions, ModelClient, ModelError, ModelReply};
pub use parse::extract_json;
pub use provider::{
    ChatMessage, ChatParams, ChatReply, ChatRole, HttpProvider, LlmProvider, MockProvider,
    ProviderError,
};
