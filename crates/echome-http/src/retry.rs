use crate::error::HttpError;
use reqwest::{Client, Request, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    8000
}

/// Retry budget for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. `0` disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff_ms: base_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
        }
    }

    /// Delay to wait after the attempt with the given zero-based index failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Total number of requests this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Returns true for responses that indicate a transient upstream problem.
///
/// Other 4xx responses are permanent client errors and are returned as-is.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// HTTP client that re-issues a request on transport errors, 5xx and 429.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// The wrapped client, for building requests.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Executes `request`, retrying per the policy.
    ///
    /// Each attempt sends a fresh clone of the request, so the body must be
    /// replayable (not a one-shot stream). Returns the first response that
    /// does not call for a retry, or [`HttpError::Exhausted`] once the budget
    /// is spent.
    pub async fn execute(&self, request: Request) -> Result<Response, HttpError> {
        let max_attempts = self.policy.max_attempts();
        let method = request.method().clone();
        let url = request.url().clone();
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let attempt_request = request.try_clone().ok_or(HttpError::BodyNotReplayable)?;

            match self.client.execute(attempt_request).await {
                Ok(response) if !is_retryable_status(response.status()) => {
                    if attempt > 0 {
                        tracing::info!(
                            %method,
                            %url,
                            attempt = attempt + 1,
                            status = %response.status(),
                            "upstream request succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    last_error = format!("upstream responded with status {}", response.status());
                }
                Err(e) => {
                    last_error = format!("transport error: {}", e);
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.policy.backoff(attempt);
                tracing::warn!(
                    %method,
                    %url,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream request: {}",
                    last_error
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(HttpError::Exhausted {
            attempts: max_attempts,
            last: last_error,
        })
    }
}
