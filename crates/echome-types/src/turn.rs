//! Conversation turns and chat messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of conversation history, in the order the client supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The unit of work submitted to the conversation pipeline.
///
/// Created per inbound client message (or per finished voice transcript) and
/// discarded once the turn completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// User input for this turn.
    pub text: String,
    /// Prior messages, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Whether the caller wants incremental output and synthesized audio.
    #[serde(default)]
    pub stream: bool,
    /// Whether the model may escalate to the search tool.
    #[serde(default)]
    pub enable_search: bool,
}

/// Reasons a turn is rejected before any upstream call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("turn text must not be empty")]
    EmptyText,

    #[error("too many context messages: {count} (limit: {limit})")]
    TooManyMessages { count: usize, limit: usize },
}

impl ConversationTurn {
    /// Checks the turn against the history limit and requires non-empty input.
    pub fn validate(&self, max_context_messages: usize) -> Result<(), TurnError> {
        if self.text.trim().is_empty() {
            return Err(TurnError::EmptyText);
        }
        if self.messages.len() > max_context_messages {
            return Err(TurnError::TooManyMessages {
                count: self.messages.len(),
                limit: max_context_messages,
            });
        }
        Ok(())
    }

    /// Builds the full prompt: persona (if any), non-empty history, then the
    /// user input.
    pub fn prompt(&self, persona: Option<&str>) -> Vec<ChatMessage> {
        let mut prompt = Vec::with_capacity(self.messages.len() + 2);
        if let Some(persona) = persona.map(str::trim).filter(|p| !p.is_empty()) {
            prompt.push(ChatMessage::system(format!(
                "Stay in character for the whole conversation. Character profile: {persona}"
            )));
        }
        prompt.extend(
            self.messages
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .cloned(),
        );
        prompt.push(ChatMessage::user(self.text.clone()));
        prompt
    }
}
