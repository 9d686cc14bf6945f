//! Decoding of client text frames.

use echome_types::{ChatMessage, ConversationTurn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// What a client text frame asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A typed turn.
    Turn(ConversationTurn),
    /// End of voice input; the transcript becomes a turn with these options.
    Finish(TurnOptions),
    /// Abort the running turn and drop the queued ones.
    Cancel,
}

/// Turn settings sent along with `finish`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnOptions {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Spoken input gets a spoken reply unless the client opts out.
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub enable_search: bool,
}

fn default_stream() -> bool {
    true
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            stream: default_stream(),
            enable_search: false,
        }
    }
}

impl TurnOptions {
    pub fn into_turn(self, text: String) -> ConversationTurn {
        ConversationTurn {
            text,
            messages: self.messages,
            stream: self.stream,
            enable_search: self.enable_search,
        }
    }
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl InboundError {
    /// Code carried by the `error` event sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Json(_) => "invalid_json",
            Self::UnknownType(_) => "unknown_type",
        }
    }
}

/// Parses one text frame.
pub fn parse(text: &str) -> Result<Inbound, InboundError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind.as_deref() {
        None => Ok(Inbound::Turn(serde_json::from_value(value)?)),
        Some("finish") => Ok(Inbound::Finish(serde_json::from_value(value)?)),
        Some("cancel") => Ok(Inbound::Cancel),
        Some(other) => Err(InboundError::UnknownType(other.to_string())),
    }
}
