use async_trait::async_trait;
use bytes::Bytes;
use echome_llm::{ChatRequest, ChatStream, ChunkSink, LlmError};
use echome_server::characters::{CharacterLookup, InMemoryCharacters, LookupError};
use echome_server::connection::ConnectionSettings;
use echome_server::pipeline::{ConversationPipeline, PipelineConfig, PipelineDeps};
use echome_server::{app, AppState};
use echome_types::{Character, CharacterStatus};
use echome_voice::{AudioSink, Recognizer, Synthesizer, Transcript, TtsConfig, TtsProfile, VoiceError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct OneLiner;

#[async_trait]
impl ChatStream for OneLiner {
    async fn stream_chat(
        &self,
        _request: &ChatRequest,
        sink: &mut dyn ChunkSink,
        _cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        sink.send_chunk("Nice to meet you.").await?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSynth {
    voices: Mutex<Vec<String>>,
}

#[async_trait]
impl Synthesizer for RecordingSynth {
    async fn synthesize(
        &self,
        profile: &TtsProfile,
        mut fragments: mpsc::Receiver<String>,
        audio: &dyn AudioSink,
        _cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        self.voices.lock().unwrap().push(profile.voice.clone());
        while let Some(text) = fragments.recv().await {
            audio.send_audio(Bytes::from(text)).await?;
        }
        Ok(())
    }
}

struct Deaf;

#[async_trait]
impl Recognizer for Deaf {
    async fn recognize(
        &self,
        mut audio: mpsc::Receiver<Bytes>,
        _transcripts: mpsc::Sender<Transcript>,
        _cancel: CancellationToken,
    ) -> Result<(), VoiceError> {
        while audio.recv().await.is_some() {}
        Ok(())
    }
}

struct BrokenStore;

#[async_trait]
impl CharacterLookup for BrokenStore {
    async fn find(&self, _id: Uuid) -> Result<Option<Character>, LookupError> {
        Err(LookupError::Unavailable("store offline".into()))
    }
}

fn character(status: CharacterStatus, voice: &str) -> Character {
    Character {
        id: Uuid::new_v4(),
        name: "Ada".into(),
        persona: "Ada is kind.".into(),
        voice_id: Some(voice.into()),
        uses_cloned_voice: true,
        status,
    }
}

async fn serve(
    characters: Arc<dyn CharacterLookup>,
) -> (SocketAddr, Arc<RecordingSynth>) {
    let synth = Arc::new(RecordingSynth::default());
    let deps = PipelineDeps {
        chat: Arc::new(OneLiner),
        synthesizer: synth.clone(),
        recognizer: Arc::new(Deaf),
        voices: Arc::new(TtsConfig::default()),
    };
    let state = AppState {
        pipeline: ConversationPipeline::new(deps, PipelineConfig::default(), CancellationToken::new()),
        characters,
        connection: ConnectionSettings::default(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    (addr, synth)
}

/// Runs one streamed turn and returns the event types seen, in order.
async fn streamed_turn(addr: SocketAddr, query: &str) -> Vec<String> {
    let url = format!("ws://{}/ws/voice-conversation{}", addr, query);
    let (mut ws, _) = connect_async(url).await.expect("failed to connect");

    let mut seen = Vec::new();
    let mut sent = false;
    while let Some(message) = ws.next().await {
        let kind = match message.unwrap() {
            Message::Text(text) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                event["type"].as_str().unwrap().to_string()
            }
            Message::Binary(_) => "audio".to_string(),
            _ => continue,
        };
        seen.push(kind.clone());

        if kind == "connection_established" && !sent {
            sent = true;
            let turn = json!({"text": "hello", "stream": true});
            ws.send(Message::Text(turn.to_string().into())).await.unwrap();
        }
        if kind == "stream_end" {
            break;
        }
    }
    ws.close(None).await.unwrap();
    seen
}

#[tokio::test]
async fn conversation_speaks_with_the_characters_cloned_voice() {
    let ada = character(CharacterStatus::Approved, "ada-voice");
    let query = format!("?characterId={}", ada.id);
    let (addr, synth) = serve(Arc::new(InMemoryCharacters::new([ada]))).await;

    let seen = streamed_turn(addr, &query).await;
    assert_eq!(
        seen,
        ["connection_established", "stream_start", "stream_chunk", "audio", "stream_end"]
    );
    assert_eq!(*synth.voices.lock().unwrap(), vec!["ada-voice".to_string()]);
}

#[tokio::test]
async fn unusable_character_ids_fall_back_to_the_default_voice() {
    let disabled = character(CharacterStatus::Disabled, "gone-voice");
    let disabled_query = format!("?characterId={}", disabled.id);
    let (addr, synth) = serve(Arc::new(InMemoryCharacters::new([disabled]))).await;

    for query in [
        "",
        "?characterId=not-a-uuid",
        "?characterId=00000000-0000-0000-0000-000000000000",
        disabled_query.as_str(),
    ] {
        let seen = streamed_turn(addr, query).await;
        assert_eq!(seen.last().map(String::as_str), Some("stream_end"), "query {:?}", query);
    }
    let voices = synth.voices.lock().unwrap().clone();
    assert_eq!(voices.len(), 4);
    assert!(voices.iter().all(|voice| voice == "Katerina"), "{:?}", voices);
}

#[tokio::test]
async fn character_store_outage_refuses_the_upgrade() {
    let (addr, _synth) = serve(Arc::new(BrokenStore)).await;

    let url = format!("ws://{}/ws/voice-conversation?characterId={}", addr, Uuid::new_v4());
    assert!(connect_async(url).await.is_err());

    // Without a character id the store is never consulted.
    let url = format!("ws://{}/ws/voice-conversation", addr);
    let (mut ws, _) = connect_async(url).await.unwrap();
    let Some(Ok(Message::Text(text))) = ws.next().await else {
        panic!("expected a greeting");
    };
    let greeting: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(greeting["type"], "connection_established");
}

#[tokio::test]
async fn health_reports_ok_over_http() {
    let (addr, _synth) = serve(Arc::new(InMemoryCharacters::default())).await;

    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}
