use echome_http::HttpError;
use echome_types::SinkError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("failed to build request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream read failed: {0}")]
    Stream(String),

    /// The sink refused a chunk; streaming stopped.
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("search failed: {0}")]
    Search(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
