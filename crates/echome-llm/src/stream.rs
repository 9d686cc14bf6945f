use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::search::SearchTool;
use crate::sink::{ChunkSink, CollectingSink};
use crate::wire::{
    search_tool_definition, CompletionRequest, StreamChunk, ToolCall, ToolCallAccumulator,
    SEARCH_TOOL_NAME,
};
use async_trait::async_trait;
use echome_http::{DataLine, LineBuffer, RetryingClient};
use echome_types::ChatMessage;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Chunk forwarded when the model asked for a search that could not run.
pub const SEARCH_UNAVAILABLE_NOTICE: &str =
    "Sorry, I couldn't look that up right now, so I'll answer from what I already know.";

const MAX_ERROR_BODY: usize = 512;

/// One chat-completion call.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Full prompt, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Offer the `perform_search` tool to the model.
    pub enable_search: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            enable_search: false,
        }
    }

    pub fn with_search(mut self, enable: bool) -> Self {
        self.enable_search = enable;
        self
    }
}

/// Streamed text generation.
#[async_trait]
pub trait ChatStream: Send + Sync {
    /// Streams the completion into `sink`, chunk by chunk, in generation
    /// order. Returns once the upstream stream ended.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError>;

    /// Runs the same call and returns the concatenated text.
    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let mut sink = CollectingSink::default();
        self.stream_chat(request, &mut sink, cancel).await?;
        Ok(sink.into_text())
    }
}

/// Result of draining one upstream stream.
#[derive(Debug)]
enum StreamOutcome {
    Completed,
    ToolRequested(Vec<ToolCall>),
}

/// Per-stream decoding state.
struct ChunkReader {
    allow_tools: bool,
    tools: ToolCallAccumulator,
    finished: bool,
}

impl ChunkReader {
    fn new(allow_tools: bool) -> Self {
        Self {
            allow_tools,
            tools: ToolCallAccumulator::default(),
            finished: false,
        }
    }

    /// Decodes one line and forwards any text it carries.
    async fn handle_line(
        &mut self,
        line: &str,
        sink: &mut dyn ChunkSink,
    ) -> Result<ControlFlow<()>, LlmError> {
        let payload = match DataLine::parse(line) {
            Some(DataLine::Payload(payload)) => payload,
            Some(DataLine::Done) => return Ok(ControlFlow::Break(())),
            None => return Ok(ControlFlow::Continue(())),
        };

        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stream chunk");
                return Ok(ControlFlow::Continue(()));
            }
        };

        for choice in chunk.choices {
            if !choice.delta.tool_calls.is_empty() {
                if self.allow_tools {
                    for delta in choice.delta.tool_calls {
                        self.tools.push(delta);
                    }
                } else {
                    tracing::debug!("ignoring tool call in follow-up completion");
                }
            }

            // Once the model switched to a tool call its remaining text is
            // superseded by the follow-up completion.
            if self.tools.is_empty() {
                if let Some(content) = choice.delta.content.as_deref() {
                    if !content.is_empty() {
                        sink.send_chunk(content).await?;
                    }
                }
            }

            if choice.finish_reason.is_some() {
                self.finished = true;
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn outcome(self) -> StreamOutcome {
        if self.tools.is_empty() {
            StreamOutcome::Completed
        } else {
            StreamOutcome::ToolRequested(self.tools.into_calls())
        }
    }
}

/// [`ChatStream`] over an OpenAI-compatible streaming endpoint.
pub struct LlmStreamAdapter {
    http: RetryingClient,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Duration,
    search: Option<Arc<dyn SearchTool>>,
    search_timeout: Duration,
}

impl LlmStreamAdapter {
    pub fn new(http: RetryingClient, config: &LlmConfig, api_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: api_key.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.timeout(),
            search: None,
            search_timeout: Duration::from_secs(10),
        }
    }

    /// Makes `perform_search` available to turns that enable search.
    pub fn with_search(mut self, search: Arc<dyn SearchTool>, timeout: Duration) -> Self {
        self.search = Some(search);
        self.search_timeout = timeout;
        self
    }

    async fn open(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<reqwest::Response, LlmError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools,
        };
        let request = self
            .http
            .inner()
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .build()?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn drain(
        &self,
        response: reqwest::Response,
        allow_tools: bool,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamOutcome, LlmError> {
        let mut reader = ChunkReader::new(allow_tools);
        let mut lines = LineBuffer::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
            for line in lines.push(&chunk) {
                if reader.handle_line(&line, sink).await?.is_break() {
                    return Ok(reader.outcome());
                }
            }
        }
        if let Some(line) = lines.finish() {
            let _ = reader.handle_line(&line, sink).await?;
        }
        if !reader.finished {
            tracing::debug!("completion stream ended without [DONE]");
        }
        Ok(reader.outcome())
    }

    async fn run(&self, request: &ChatRequest, sink: &mut dyn ChunkSink) -> Result<(), LlmError> {
        let tools = match (&self.search, request.enable_search) {
            (Some(_), true) => vec![search_tool_definition()],
            _ => Vec::new(),
        };

        let response = self.open(&request.messages, &tools).await?;
        let calls = match self.drain(response, !tools.is_empty(), sink).await? {
            StreamOutcome::Completed => return Ok(()),
            StreamOutcome::ToolRequested(calls) => calls,
        };

        let Some(call) = calls.iter().find(|c| c.name == SEARCH_TOOL_NAME) else {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            tracing::warn!(?names, "model requested an unknown tool");
            return Ok(());
        };

        // The follow-up never offers tools, with or without search results.
        let mut messages = request.messages.clone();
        match self.run_search(call).await {
            Ok(digest) => messages.push(ChatMessage::system(format!(
                "Web search results for the user's question:\n{}",
                digest
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "search tool failed, answering without it");
                sink.send_chunk(SEARCH_UNAVAILABLE_NOTICE).await?;
            }
        }
        let response = self.open(&messages, &[]).await?;
        self.drain(response, false, sink).await?;
        Ok(())
    }

    async fn run_search(&self, call: &ToolCall) -> Result<String, LlmError> {
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| LlmError::Search("search is not configured".into()))?;
        let query = call
            .query()
            .ok_or_else(|| LlmError::Search("tool call carried no query".into()))?;

        tracing::info!(%query, "running search tool");
        tokio::time::timeout(self.search_timeout, search.search(&query))
            .await
            .map_err(|_| LlmError::Search(format!("timed out after {:?}", self.search_timeout)))?
    }
}

#[async_trait]
impl ChatStream for LlmStreamAdapter {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.run(request, sink)) => {
                result.map_err(|_| LlmError::Timeout(self.timeout))?
            }
        }
    }
}
