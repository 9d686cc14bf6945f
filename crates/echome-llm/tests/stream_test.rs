//! Streaming behaviour against a scripted local completion endpoint.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use echome_http::{RetryPolicy, RetryingClient};
use echome_llm::{
    ChatRequest, ChatStream, ChunkSink, LlmConfig, LlmError, LlmStreamAdapter, SearchTool,
    SEARCH_UNAVAILABLE_NOTICE,
};
use echome_types::{ChatMessage, SinkError};
use futures_util::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Reply {
    Sse(String),
    Status(u16, String),
    /// Sends the body, then keeps the stream open forever.
    Hang(String),
}

#[derive(Clone)]
struct Upstream {
    replies: Arc<Vec<Reply>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn completions(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    let n = {
        let mut requests = upstream.requests.lock().unwrap();
        requests.push(body);
        requests.len() - 1
    };
    let reply = upstream
        .replies
        .get(n)
        .cloned()
        .unwrap_or(Reply::Status(500, "unscripted".into()));
    match reply {
        Reply::Sse(text) => ([(header::CONTENT_TYPE, "text/event-stream")], text).into_response(),
        Reply::Status(code, text) => (StatusCode::from_u16(code).unwrap(), text).into_response(),
        Reply::Hang(text) => {
            let stream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(text)])
                .chain(futures_util::stream::pending());
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

async fn spawn_upstream(replies: Vec<Reply>) -> (SocketAddr, Upstream) {
    let upstream = Upstream {
        replies: Arc::new(replies),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(upstream.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, upstream)
}

fn adapter(addr: SocketAddr, timeout_secs: u64) -> LlmStreamAdapter {
    let config = LlmConfig {
        endpoint: format!("http://{}/v1/chat/completions", addr),
        model: "test-model".into(),
        timeout_secs,
        ..LlmConfig::default()
    };
    let http = RetryingClient::new(
        reqwest::Client::new(),
        RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
    );
    LlmStreamAdapter::new(http, &config, "sk-test")
}

fn content(text: &str) -> String {
    let chunk = serde_json::json!({"choices":[{"delta":{"content":text}}]});
    format!("data: {}\n\n", chunk)
}

fn sse(parts: &[String]) -> String {
    let mut body = parts.concat();
    body.push_str("data: [DONE]\n\n");
    body
}

#[derive(Default)]
struct RecordingSink {
    chunks: Vec<String>,
    reject_after: Option<usize>,
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn send_chunk(&mut self, chunk: &str) -> Result<(), SinkError> {
        if let Some(limit) = self.reject_after {
            if self.chunks.len() >= limit {
                return Err(SinkError::new("client gone"));
            }
        }
        self.chunks.push(chunk.to_string());
        Ok(())
    }
}

struct FakeSearch {
    calls: AtomicUsize,
    result: Result<String, String>,
}

#[async_trait]
impl SearchTool for FakeSearch {
    async fn search(&self, query: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(query, "weather in Paris");
        self.result.clone().map_err(LlmError::Search)
    }
}

fn request(text: &str) -> ChatRequest {
    ChatRequest::new(vec![ChatMessage::system("be nice"), ChatMessage::user(text)])
}

#[tokio::test]
async fn forwards_chunks_in_order_and_skips_malformed_lines() {
    let body = sse(&[
        content("Hel"),
        "data: {not json}\n\n".to_string(),
        ": keep-alive\n\n".to_string(),
        content("lo"),
        content("!"),
    ]);
    let (addr, upstream) = spawn_upstream(vec![Reply::Sse(body)]).await;
    let adapter = adapter(addr, 5);

    let mut sink = RecordingSink::default();
    adapter
        .stream_chat(&request("hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.chunks, vec!["Hel", "lo", "!"]);

    let sent = upstream.requests.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "test-model");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["messages"][1]["content"], "hi");
    assert!(sent.get("tools").is_none());
}

#[tokio::test]
async fn complete_concatenates_the_stream() {
    let body = sse(&[content("Bon"), content("jour")]);
    let (addr, _) = spawn_upstream(vec![Reply::Sse(body)]).await;

    let text = adapter(addr, 5)
        .complete(&request("hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "Bonjour");
}

#[tokio::test]
async fn unterminated_last_line_is_still_delivered() {
    let mut body = content("Hello");
    body.push_str(content(" there").trim_end());
    let (addr, _) = spawn_upstream(vec![Reply::Sse(body)]).await;

    let text = adapter(addr, 5)
        .complete(&request("hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "Hello there");
}

#[tokio::test]
async fn sink_rejection_stops_the_stream() {
    let body = sse(&[content("a"), content("b"), content("c")]);
    let (addr, _) = spawn_upstream(vec![Reply::Sse(body)]).await;

    let mut sink = RecordingSink {
        reject_after: Some(1),
        ..Default::default()
    };
    let err = adapter(addr, 5)
        .stream_chat(&request("hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Sink(_)), "got {:?}", err);
    assert_eq!(sink.chunks, vec!["a"]);
}

#[tokio::test]
async fn non_success_status_is_reported_with_body() {
    let (addr, upstream) =
        spawn_upstream(vec![Reply::Status(400, "bad model".into())]).await;

    let mut sink = RecordingSink::default();
    let err = adapter(addr, 5)
        .stream_chat(&request("hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LlmError::Status { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad model");
        }
        other => panic!("expected Status, got {:?}", other),
    }
    assert_eq!(upstream.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let (addr, _) = spawn_upstream(vec![Reply::Hang(content("partial"))]).await;

    let mut sink = RecordingSink::default();
    let err = adapter(addr, 1)
        .stream_chat(&request("hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Timeout(_)), "got {:?}", err);
    assert_eq!(sink.chunks, vec!["partial"]);
}

#[tokio::test]
async fn cancellation_interrupts_a_stalled_stream() {
    let (addr, _) = spawn_upstream(vec![Reply::Hang(content("partial"))]).await;
    let adapter = adapter(addr, 30);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let mut sink = RecordingSink::default();
    let err = adapter
        .stream_chat(&request("hi"), &mut sink, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

fn tool_call_stream() -> String {
    let first = serde_json::json!({"choices":[{"delta":{"tool_calls":[
        {"index":0,"id":"call_1","type":"function",
         "function":{"name":"perform_search","arguments":"{\"query\":"}}
    ]}}]});
    let second = serde_json::json!({"choices":[{"delta":{"tool_calls":[
        {"index":0,"function":{"arguments":"\"weather in Paris\"}"}}
    ]},"finish_reason":"tool_calls"}]});
    sse(&[
        content("Let me check. "),
        format!("data: {}\n\n", first),
        format!("data: {}\n\n", second),
    ])
}

#[tokio::test]
async fn search_tool_call_triggers_one_follow_up() {
    let nested = serde_json::json!({"choices":[{"delta":{"tool_calls":[
        {"name":"perform_search","parameters":{"query":"again"}}
    ]}}]});
    let follow_up = sse(&[
        content("It is sunny"),
        format!("data: {}\n\n", nested),
        content(" today."),
    ]);
    let (addr, upstream) =
        spawn_upstream(vec![Reply::Sse(tool_call_stream()), Reply::Sse(follow_up)]).await;

    let search = Arc::new(FakeSearch {
        calls: AtomicUsize::new(0),
        result: Ok("Search answer: sunny".into()),
    });
    let adapter = adapter(addr, 5).with_search(search.clone(), Duration::from_secs(1));

    let mut sink = RecordingSink::default();
    adapter
        .stream_chat(
            &request("weather?").with_search(true),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(sink.chunks, vec!["Let me check. ", "It is sunny", " today."]);
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);

    let requests = upstream.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["tools"][0]["function"]["name"], "perform_search");
    assert!(requests[1].get("tools").is_none());
    let last = requests[1]["messages"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["role"], "system");
    assert!(last["content"].as_str().unwrap().contains("Search answer: sunny"));
}

#[tokio::test]
async fn failed_search_sends_notice_then_answers_without_results() {
    let follow_up = sse(&[content("Probably sunny.")]);
    let (addr, upstream) =
        spawn_upstream(vec![Reply::Sse(tool_call_stream()), Reply::Sse(follow_up)]).await;

    let search = Arc::new(FakeSearch {
        calls: AtomicUsize::new(0),
        result: Err("quota exceeded".into()),
    });
    let adapter = adapter(addr, 5).with_search(search, Duration::from_secs(1));

    let mut sink = RecordingSink::default();
    adapter
        .stream_chat(
            &request("weather?").with_search(true),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        sink.chunks,
        vec!["Let me check. ", SEARCH_UNAVAILABLE_NOTICE, "Probably sunny."]
    );

    let requests = upstream.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].get("tools").is_none());
    let messages = requests[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "weather?");
}

#[tokio::test]
async fn tools_are_not_offered_when_search_is_disabled() {
    let body = sse(&[content("ok")]);
    let (addr, upstream) = spawn_upstream(vec![Reply::Sse(body)]).await;
    let search = Arc::new(FakeSearch {
        calls: AtomicUsize::new(0),
        result: Ok(String::new()),
    });
    let adapter = adapter(addr, 5).with_search(search, Duration::from_secs(1));

    let mut sink = RecordingSink::default();
    adapter
        .stream_chat(&request("hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert!(upstream.requests.lock().unwrap()[0].get("tools").is_none());
}
