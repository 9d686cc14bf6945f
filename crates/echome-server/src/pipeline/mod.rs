//! Conversation orchestration for one client connection.
//!
//! [`ConversationPipeline::run`] reads the client socket and queues turns;
//! a worker runs them one at a time. A streamed turn is a supervised group
//! of two tasks joined by the bounded handoff queue: generation emits each
//! chunk to the client and queues segmented text, synthesis speaks the
//! queued text in order. Either failing aborts the turn, not the
//! connection.
//!
//! Binary frames are audio: the first one opens a recognition session whose
//! transcript, once the client sends `finish`, is queued as a turn.

pub mod group;
pub mod handoff;
pub mod inbound;
pub mod segment;
mod turn;
mod voice;

use crate::connection::{ConnectionError, Frame, SerializedConnection};
use echome_llm::{ChatStream, LlmError};
use echome_types::{Character, ClientEvent, SinkError, TurnError, DEFAULT_MAX_CONTEXT_MESSAGES};
use echome_voice::{Recognizer, Synthesizer, TtsConfig, VoiceError};
use inbound::Inbound;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turn::{TurnRunner, Work};
use voice::VoiceInput;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid turn: {0}")]
    InvalidTurn(#[from] TurnError),

    #[error("generation failed: {0}")]
    Generation(#[source] LlmError),

    #[error("synthesis failed: {0}")]
    Synthesis(#[source] VoiceError),

    #[error("recognition failed: {0}")]
    Recognition(#[source] VoiceError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Audio could not be delivered to the client.
    #[error("client delivery failed: {0}")]
    Delivery(#[from] SinkError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("pipeline task failed: {0}")]
    Join(String),
}

impl PipelineError {
    pub(crate) fn generation(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => Self::Cancelled,
            LlmError::Sink(refused) => Self::Delivery(refused),
            other => Self::Generation(other),
        }
    }

    pub(crate) fn synthesis(err: VoiceError) -> Self {
        match err {
            VoiceError::Cancelled => Self::Cancelled,
            VoiceError::Sink(refused) => Self::Delivery(refused),
            other => Self::Synthesis(other),
        }
    }

    pub(crate) fn recognition(err: VoiceError) -> Self {
        match err {
            VoiceError::Cancelled => Self::Cancelled,
            VoiceError::Sink(refused) => Self::Delivery(refused),
            other => Self::Recognition(other),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the client can no longer be reached.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Delivery(_))
    }

    /// Event telling the client its turn failed.
    fn client_event(&self) -> ClientEvent {
        match self {
            Self::InvalidTurn(err) => ClientEvent::error_with_code("invalid_turn", err.to_string()),
            Self::Generation(err) => ClientEvent::error_with_code(
                "generation_failed",
                format!("failed to generate a response: {}", err),
            ),
            Self::Synthesis(err) => ClientEvent::tts_error(err.to_string()),
            Self::Recognition(err) => ClientEvent::error_with_code(
                "asr_failed",
                format!("speech recognition failed: {}", err),
            ),
            other => ClientEvent::error(other.to_string()),
        }
    }
}

/// Reports a failed turn to the client.
///
/// Cancellation is silent. Connection-fatal errors are handed back, as is
/// any failure to deliver the report itself.
pub(crate) async fn report(
    connection: &SerializedConnection,
    err: PipelineError,
) -> Result<(), PipelineError> {
    if err.is_connection_fatal() {
        return Err(err);
    }
    if err.is_cancellation() {
        tracing::debug!(connection = %connection.id(), "turn cancelled");
        return Ok(());
    }
    let event = err.client_event();
    tracing::warn!(connection = %connection.id(), error = %err, event = event.kind(), "turn failed");
    connection.send_event(&event).await?;
    Ok(())
}

fn default_handoff_capacity() -> usize {
    100
}

fn default_segment_min_chars() -> usize {
    50
}

fn default_max_context_messages() -> usize {
    DEFAULT_MAX_CONTEXT_MESSAGES
}

fn default_turn_queue_capacity() -> usize {
    8
}

fn default_audio_queue_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Segments buffered between generation and synthesis.
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,

    /// Unpunctuated text is sent to synthesis once it reaches this length.
    #[serde(default = "default_segment_min_chars")]
    pub segment_min_chars: usize,

    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,

    /// Turns waiting behind the running one; more are refused as busy.
    #[serde(default = "default_turn_queue_capacity")]
    pub turn_queue_capacity: usize,

    /// Audio frames buffered ahead of the recognizer.
    #[serde(default = "default_audio_queue_capacity")]
    pub audio_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            handoff_capacity: default_handoff_capacity(),
            segment_min_chars: default_segment_min_chars(),
            max_context_messages: default_max_context_messages(),
            turn_queue_capacity: default_turn_queue_capacity(),
            audio_queue_capacity: default_audio_queue_capacity(),
        }
    }
}

/// The upstream adapters a pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub chat: Arc<dyn ChatStream>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub recognizer: Arc<dyn Recognizer>,
    /// Default and cloned-voice synthesis profiles.
    pub voices: Arc<TtsConfig>,
}

#[derive(Clone)]
pub struct ConversationPipeline {
    deps: PipelineDeps,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl ConversationPipeline {
    /// `shutdown` is the server-wide token; every session runs under a
    /// child of it.
    pub fn new(deps: PipelineDeps, config: PipelineConfig, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            config,
            shutdown,
        }
    }

    /// Serves one conversation until the client leaves, the server shuts
    /// down or the connection fails. Closes `connection` before returning.
    pub async fn run(
        &self,
        connection: Arc<SerializedConnection>,
        character: Option<Character>,
    ) -> Result<(), PipelineError> {
        let root = self.shutdown.child_token();
        let cloned_voice = character.as_ref().and_then(Character::cloned_voice);
        let voice = Arc::new(self.deps.voices.select(cloned_voice));
        tracing::info!(
            connection = %connection.id(),
            character = ?character.as_ref().map(|c| c.id),
            model = %voice.model,
            voice = %voice.voice,
            "conversation started"
        );

        let runner = TurnRunner {
            chat: self.deps.chat.clone(),
            synthesizer: self.deps.synthesizer.clone(),
            connection: connection.clone(),
            voice,
            persona: character.map(|c| c.persona),
            config: self.config.clone(),
        };
        let (queue, pending) = mpsc::channel(self.config.turn_queue_capacity.max(1));
        let worker = tokio::spawn(runner.work(pending, root.clone()));

        let read = self.read_turns(&connection, queue, &root).await;
        root.cancel();
        let worked = worker
            .await
            .unwrap_or_else(|e| Err(PipelineError::Join(e.to_string())));
        if let Err(err) = connection.close().await {
            tracing::debug!(connection = %connection.id(), error = %err, "connection closed uncleanly");
        }

        tracing::info!(connection = %connection.id(), "conversation ended");
        read.and(worked)
    }

    async fn read_turns(
        &self,
        connection: &Arc<SerializedConnection>,
        queue: mpsc::Sender<Work>,
        root: &CancellationToken,
    ) -> Result<(), PipelineError> {
        // Replaced on every client `cancel`, so queued work keeps the scope
        // it was queued under.
        let mut scope = root.child_token();
        let mut voice: Option<VoiceInput> = None;
        let mut voice_failed = false;
        // Transcript of a recognition session that ended before `finish`.
        let mut early: Option<String> = None;

        loop {
            let frame = tokio::select! {
                _ = root.cancelled() => return Ok(()),
                frame = connection.receive() => frame,
            };

            match frame {
                Ok(Frame::Text(text)) => match inbound::parse(&text) {
                    Err(err) => {
                        tracing::warn!(connection = %connection.id(), error = %err, "rejected client message");
                        connection
                            .send_event(&ClientEvent::error_with_code(err.code(), err.to_string()))
                            .await?;
                    }
                    Ok(Inbound::Turn(turn)) => {
                        let work = Work::Text {
                            turn,
                            cancel: scope.clone(),
                        };
                        enqueue(connection, &queue, work).await?;
                    }
                    Ok(Inbound::Finish(options)) => match voice.take() {
                        Some(input) => {
                            let work = Work::Voice {
                                transcript: input.finish(),
                                options,
                                cancel: scope.clone(),
                            };
                            enqueue(connection, &queue, work).await?;
                        }
                        None if voice_failed => {
                            voice_failed = false;
                            match early.take() {
                                Some(text) if !text.trim().is_empty() => {
                                    let work = Work::Text {
                                        turn: options.into_turn(text),
                                        cancel: scope.clone(),
                                    };
                                    enqueue(connection, &queue, work).await?;
                                }
                                _ => {
                                    tracing::debug!(connection = %connection.id(), "no transcript to answer")
                                }
                            }
                        }
                        None => {
                            connection
                                .send_event(&ClientEvent::error_with_code(
                                    "no_audio",
                                    "finish received without any audio",
                                ))
                                .await?;
                        }
                    },
                    Ok(Inbound::Cancel) => {
                        tracing::info!(connection = %connection.id(), "client cancelled pending turns");
                        scope.cancel();
                        scope = root.child_token();
                        if let Some(input) = voice.take() {
                            input.abort();
                        }
                        voice_failed = false;
                        early = None;
                    }
                },
                Ok(Frame::Binary(audio)) => {
                    if voice_failed {
                        continue;
                    }
                    let input = voice.get_or_insert_with(|| {
                        VoiceInput::start(
                            self.deps.recognizer.clone(),
                            connection.clone(),
                            self.config.audio_queue_capacity,
                            root.child_token(),
                        )
                    });
                    let accepted = tokio::select! {
                        _ = root.cancelled() => return Ok(()),
                        accepted = input.push(audio) => accepted,
                    };
                    if !accepted {
                        // The session ended before the client finished; drop
                        // audio until `finish`, which answers what was heard.
                        voice_failed = true;
                        if let Some(input) = voice.take() {
                            match input.finish().wait().await {
                                Ok(text) => {
                                    tracing::debug!(connection = %connection.id(), "recognition ended before finish");
                                    early = Some(text);
                                }
                                Err(err) => report(connection, err).await?,
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(ConnectionError::PeerClosed) => {
                    tracing::debug!(connection = %connection.id(), "client closed the connection");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Serves a recognition-only session: audio in, `asr_result` and
    /// `asr_finished` out, one utterance per `finish`.
    pub async fn run_recognition(
        &self,
        connection: Arc<SerializedConnection>,
    ) -> Result<(), PipelineError> {
        let root = self.shutdown.child_token();
        let result = self.read_audio(&connection, &root).await;
        root.cancel();
        if let Err(err) = connection.close().await {
            tracing::debug!(connection = %connection.id(), error = %err, "connection closed uncleanly");
        }
        result
    }

    async fn read_audio(
        &self,
        connection: &Arc<SerializedConnection>,
        root: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut voice: Option<VoiceInput> = None;

        loop {
            let frame = tokio::select! {
                _ = root.cancelled() => return Ok(()),
                frame = connection.receive() => frame,
            };

            match frame {
                Ok(Frame::Binary(audio)) => {
                    let input = voice.get_or_insert_with(|| {
                        VoiceInput::start(
                            self.deps.recognizer.clone(),
                            connection.clone(),
                            self.config.audio_queue_capacity,
                            root.child_token(),
                        )
                    });
                    if !input.push(audio).await {
                        if let Some(input) = voice.take() {
                            if let Err(err) = input.finish().wait().await {
                                report(connection, err).await?;
                            }
                        }
                    }
                }
                Ok(Frame::Text(text)) => match inbound::parse(&text) {
                    Ok(Inbound::Finish(_)) => {
                        if let Some(input) = voice.take() {
                            if let Err(err) = input.finish().wait().await {
                                report(connection, err).await?;
                            }
                        }
                    }
                    Ok(Inbound::Cancel) => {
                        if let Some(input) = voice.take() {
                            input.abort();
                        }
                    }
                    Ok(Inbound::Turn(_)) => {
                        connection
                            .send_event(&ClientEvent::error_with_code(
                                "unsupported",
                                "this endpoint only accepts audio",
                            ))
                            .await?;
                    }
                    Err(err) => {
                        connection
                            .send_event(&ClientEvent::error_with_code(err.code(), err.to_string()))
                            .await?;
                    }
                },
                Ok(_) => {}
                Err(ConnectionError::PeerClosed) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn enqueue(
    connection: &SerializedConnection,
    queue: &mpsc::Sender<Work>,
    work: Work,
) -> Result<(), PipelineError> {
    match queue.try_send(work) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(connection = %connection.id(), "turn queue full, refusing turn");
            connection
                .send_event(&ClientEvent::error_with_code(
                    "busy",
                    "too many turns are waiting, try again shortly",
                ))
                .await?;
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Cancelled),
    }
}
