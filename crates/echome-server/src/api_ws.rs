//! WebSocket routes: upgrade, resolve the character, hand over to the
//! pipeline.

use crate::connection::SerializedConnection;
use crate::AppState;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension,
};
use echome_types::{Character, ClientEvent};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Query parameters for `GET /ws/voice-conversation`.
#[derive(Debug, Deserialize)]
pub struct VoiceConversationParams {
    #[serde(rename = "characterId")]
    pub character_id: Option<String>,
}

/// `GET /ws/voice-conversation?characterId=...`
///
/// A missing, malformed, unknown or disabled character id starts a
/// conversation without a character (default voice, no persona).
pub async fn voice_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<VoiceConversationParams>,
) -> Response {
    let character = match resolve_character(&state, params.character_id.as_deref()).await {
        Ok(character) => character,
        Err(status) => return status.into_response(),
    };
    ws.on_upgrade(move |socket| handle_conversation(socket, state, character))
}

/// `GET /ws/asr`: recognition only.
pub async fn asr_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_recognition(socket, state))
}

async fn resolve_character(
    state: &AppState,
    raw_id: Option<&str>,
) -> Result<Option<Character>, StatusCode> {
    let Some(raw_id) = raw_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    let Ok(id) = Uuid::parse_str(raw_id) else {
        tracing::debug!(character_id = %raw_id, "ignoring malformed character id");
        return Ok(None);
    };
    if id.is_nil() {
        return Ok(None);
    }

    match state.characters.find(id).await {
        Ok(Some(character)) if character.is_disabled() => {
            tracing::info!(character_id = %id, "character is disabled, using defaults");
            Ok(None)
        }
        Ok(Some(character)) => Ok(Some(character)),
        Ok(None) => {
            tracing::info!(character_id = %id, "character not found, using defaults");
            Ok(None)
        }
        Err(err) => {
            tracing::error!(character_id = %id, error = %err, "character lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn open(socket: WebSocket, state: &AppState) -> Option<Arc<SerializedConnection>> {
    let connection = Arc::new(SerializedConnection::from_axum(socket, state.connection));
    match connection
        .send_event(&ClientEvent::connection_established())
        .await
    {
        Ok(()) => Some(connection),
        Err(err) => {
            tracing::warn!(connection = %connection.id(), error = %err, "failed to greet client");
            let _ = connection.close().await;
            None
        }
    }
}

async fn handle_conversation(
    socket: WebSocket,
    state: Arc<AppState>,
    character: Option<Character>,
) {
    let Some(connection) = open(socket, &state).await else {
        return;
    };
    let id = connection.id();
    if let Err(err) = state.pipeline.run(connection, character).await {
        tracing::warn!(connection = %id, error = %err, "conversation ended with an error");
    }
}

async fn handle_recognition(socket: WebSocket, state: Arc<AppState>) {
    let Some(connection) = open(socket, &state).await else {
        return;
    };
    let id = connection.id();
    if let Err(err) = state.pipeline.run_recognition(connection).await {
        tracing::warn!(connection = %id, error = %err, "recognition session ended with an error");
    }
}
