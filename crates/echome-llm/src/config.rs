use echome_http::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

fn default_endpoint() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "qwen-plus".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> Option<u32> {
    Some(1500)
}

fn default_temperature() -> Option<f32> {
    Some(0.7)
}

/// Chat-completion upstream settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Bound on one whole call: connect, first byte, full stream drain and
    /// any search follow-up.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,

    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_max_results() -> u32 {
    3
}

/// Web-search tool settings. Search is available only when `api_key` is set.
#[derive(Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key: String::new(),
            timeout_secs: default_search_timeout_secs(),
            max_results: default_max_results(),
        }
    }
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("max_results", &self.max_results)
            .finish()
    }
}

impl SearchConfig {
    pub fn is_enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
