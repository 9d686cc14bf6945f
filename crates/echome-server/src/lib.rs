//! Echome voice conversation server.

pub mod api_ws;
pub mod characters;
pub mod config;
pub mod connection;
pub mod pipeline;

use axum::{routing::get, Extension, Json, Router};
use characters::{CharacterLookup, InMemoryCharacters};
use config::Config;
use connection::ConnectionSettings;
use echome_http::RetryingClient;
use echome_llm::{LlmStreamAdapter, TavilySearch};
use echome_voice::{AsrAdapter, TtsAdapter};
use pipeline::{ConversationPipeline, PipelineDeps};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Connect bound for the shared HTTP client; whole-call bounds come from
/// the per-upstream settings.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ConversationPipeline,
    pub characters: Arc<dyn CharacterLookup>,
    /// Socket settings applied to every upgraded client connection.
    pub connection: ConnectionSettings,
}

impl AppState {
    /// Wires the upstream adapters described by `config`.
    ///
    /// Sessions started from this state are cancelled when `shutdown` is.
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        let http = RetryingClient::new(client, config.llm.retry);

        let mut chat = LlmStreamAdapter::new(http.clone(), &config.llm, &config.upstream.api_key);
        if config.search.is_enabled() {
            let search = TavilySearch::new(http, config.search.clone());
            chat = chat.with_search(Arc::new(search), config.search.timeout());
            tracing::info!("web search enabled");
        }

        let deps = PipelineDeps {
            chat: Arc::new(chat),
            synthesizer: Arc::new(TtsAdapter::new(config.tts.clone(), &config.upstream.api_key)),
            recognizer: Arc::new(AsrAdapter::new(config.asr.clone(), &config.upstream.api_key)),
            voices: Arc::new(config.tts.clone()),
        };
        let characters = InMemoryCharacters::new(config.characters.iter().cloned());
        tracing::info!(count = characters.len(), "loaded characters");

        Ok(Self {
            pipeline: ConversationPipeline::new(deps, config.pipeline.clone(), shutdown),
            characters: Arc::new(characters),
            connection: config.connection,
        })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/ws/voice-conversation",
            get(api_ws::voice_conversation_handler),
        )
        .route("/ws/asr", get(api_ws::asr_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
