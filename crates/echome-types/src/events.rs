//! Client-facing wire events.
//!
//! Every JSON frame the gateway writes to a client is one of these variants,
//! tagged by `type`. Binary frames on the same connection carry raw audio and
//! are not represented here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
    },
    StreamStart {
        timestamp: DateTime<Utc>,
    },
    StreamChunk {
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// Closes a streamed turn. `response` is the concatenation of every
    /// `stream_chunk` of the turn.
    StreamEnd {
        response: String,
        timestamp: DateTime<Utc>,
    },
    TextResponse {
        response: String,
        message_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    AsrResult {
        text: String,
        sentence_end: bool,
    },
    AsrFinished,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    TtsError {
        message: String,
    },
}

impl ClientEvent {
    pub fn connection_established() -> Self {
        Self::ConnectionEstablished {
            timestamp: Utc::now(),
        }
    }

    pub fn stream_start() -> Self {
        Self::StreamStart {
            timestamp: Utc::now(),
        }
    }

    pub fn stream_chunk(content: impl Into<String>) -> Self {
        Self::StreamChunk {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stream_end(response: impl Into<String>) -> Self {
        Self::StreamEnd {
            response: response.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn text_response(response: impl Into<String>) -> Self {
        Self::TextResponse {
            response: response.into(),
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn tts_error(message: impl Into<String>) -> Self {
        Self::TtsError {
            message: message.into(),
        }
    }

    /// Wire name of the event, as written in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::StreamStart { .. } => "stream_start",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamEnd { .. } => "stream_end",
            Self::TextResponse { .. } => "text_response",
            Self::AsrResult { .. } => "asr_result",
            Self::AsrFinished => "asr_finished",
            Self::Error { .. } => "error",
            Self::TtsError { .. } => "tts_error",
        }
    }
}
