//! Shared types for the echome voice-conversation gateway.
//!
//! This crate holds the domain types that cross crate boundaries: the
//! read-only character profile, conversation turns and chat messages, the
//! client-facing wire events, and the error a delivery sink reports when it
//! refuses further output.
//!
//! Nothing here performs I/O. The adapter crates (`echome-llm`,
//! `echome-voice`) and the server depend on this crate, never the reverse.

pub mod character;
pub mod events;
pub mod turn;

pub use character::{Character, CharacterStatus};
pub use events::ClientEvent;
pub use turn::{ChatMessage, ConversationTurn, Role, TurnError};

use thiserror::Error;

/// Error returned by a delivery sink (text chunks or audio frames) when it
/// can no longer accept output, typically because the client socket closed.
///
/// A producer that receives this error must stop streaming immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink rejected delivery: {reason}")]
pub struct SinkError {
    pub reason: String,
}

impl SinkError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Default cap on prior-turn messages accepted with a single turn.
pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 20;
