use crate::config::SearchConfig;
use crate::error::LlmError;
use async_trait::async_trait;
use echome_http::RetryingClient;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A web-search backend the model may call once per turn.
#[async_trait]
pub trait SearchTool: Send + Sync {
    /// Runs `query` and returns a plain-text digest suitable for a system
    /// message.
    async fn search(&self, query: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    search_depth: &'static str,
    include_answer: bool,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// Tavily search API client.
pub struct TavilySearch {
    http: RetryingClient,
    config: SearchConfig,
}

impl TavilySearch {
    pub fn new(http: RetryingClient, config: SearchConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl SearchTool for TavilySearch {
    async fn search(&self, query: &str) -> Result<String, LlmError> {
        let body = TavilyRequest {
            query,
            search_depth: "basic",
            include_answer: true,
            max_results: self.config.max_results,
        };
        let request = self
            .http
            .inner()
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .build()?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Search(format!("status {}: {}", status, text)));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Search(format!("invalid response: {}", e)))?;
        Ok(format_results(&parsed))
    }
}

fn format_results(response: &TavilyResponse) -> String {
    let mut out = String::new();
    if let Some(answer) = response.answer.as_deref().filter(|a| !a.trim().is_empty()) {
        let _ = writeln!(out, "Search answer: {}", answer.trim());
    }
    if !response.results.is_empty() {
        out.push_str("Sources:\n");
        for (i, result) in response.results.iter().enumerate() {
            let _ = writeln!(out, "{}. URL: {}", i + 1, result.url);
            let _ = writeln!(out, "   Content: {}", result.content.trim());
        }
    }
    if out.is_empty() {
        out.push_str("No search results.");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_answer_and_sources() {
        let response: TavilyResponse = serde_json::from_str(
            r#"{"answer":"It is sunny.","results":[
                {"url":"https://a.example","content":"Sunny all day"},
                {"url":"https://b.example","content":" Clear skies "}
            ]}"#,
        )
        .unwrap();
        let text = format_results(&response);
        assert!(text.starts_with("Search answer: It is sunny."));
        assert!(text.contains("1. URL: https://a.example"));
        assert!(text.contains("   Content: Clear skies"));
    }

    #[test]
    fn empty_response_still_says_something() {
        let response: TavilyResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(format_results(&response), "No search results.");
    }
}
