use crate::session::{SessionEvent, SessionState};
use echome_http::HttpError;
use echome_types::SinkError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("upstream socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("upstream closed the session before it finished")]
    UpstreamClosed,

    /// The upstream rejected or aborted the task.
    #[error("upstream task failed ({code}): {message}")]
    TaskFailed { code: String, message: String },

    #[error("illegal session transition from {from:?} on {event:?}")]
    IllegalTransition {
        from: SessionState,
        event: SessionEvent,
    },

    #[error("timed out after {after:?} while {during}")]
    Timeout { during: &'static str, after: Duration },

    #[error("failed to encode upstream command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid audio payload: {0}")]
    Audio(String),

    /// The consumer of transcripts or audio went away.
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("failed to build request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("voice enrollment failed: {0}")]
    Enrollment(String),

    #[error("voice session cancelled")]
    Cancelled,
}

impl VoiceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
