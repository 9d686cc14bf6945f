//! HTTP plumbing shared by the upstream adapters.
//!
//! [`RetryingClient`] wraps a `reqwest::Client` with bounded exponential
//! backoff for transient upstream failures, and [`sse`] decodes the
//! `data:`-framed event streams returned by streaming chat completions.

pub mod error;
pub mod retry;
pub mod sse;

pub use error::HttpError;
pub use retry::{RetryPolicy, RetryingClient};
pub use sse::{DataLine, LineBuffer};
