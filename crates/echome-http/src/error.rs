use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("failed to build request: {0}")]
    Build(#[from] reqwest::Error),

    /// The request body is a one-shot stream and cannot be re-sent.
    #[error("request body cannot be replayed for retry")]
    BodyNotReplayable,

    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}
