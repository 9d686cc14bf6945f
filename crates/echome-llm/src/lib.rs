//! Streaming chat-completion adapter.
//!
//! [`LlmStreamAdapter`] drives one streamed chat completion against an
//! OpenAI-compatible endpoint and forwards text deltas, in order, to a
//! caller-supplied [`ChunkSink`]. When search augmentation is enabled the
//! model may request the `perform_search` tool once per turn; the adapter
//! runs the [`SearchTool`], appends the result as a system message and
//! streams a single follow-up completion through the same sink.

pub mod config;
pub mod error;
pub mod search;
pub mod sink;
pub mod stream;
mod wire;

pub use config::{LlmConfig, SearchConfig};
pub use error::LlmError;
pub use search::{SearchTool, TavilySearch};
pub use sink::{ChunkSink, CollectingSink};
pub use stream::{ChatRequest, ChatStream, LlmStreamAdapter, SEARCH_UNAVAILABLE_NOTICE};
