//! Runs queued turns, one at a time, in arrival order.

use super::group::TaskGroup;
use super::handoff::{self, HandoffReceiver, HandoffSender};
use super::inbound::TurnOptions;
use super::segment::Segmenter;
use super::voice::PendingTranscript;
use super::{report, PipelineConfig, PipelineError};
use crate::connection::SerializedConnection;
use async_trait::async_trait;
use echome_llm::{ChatRequest, ChatStream, ChunkSink, LlmError};
use echome_types::{ClientEvent, ConversationTurn, SinkError};
use echome_voice::{Synthesizer, TtsProfile};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One unit of queued work. `cancel` is the client's cancel scope at the
/// time the work was queued.
pub(crate) enum Work {
    Text {
        turn: ConversationTurn,
        cancel: CancellationToken,
    },
    Voice {
        transcript: PendingTranscript,
        options: TurnOptions,
        cancel: CancellationToken,
    },
}

/// Everything a turn needs, resolved once per connection.
#[derive(Clone)]
pub(crate) struct TurnRunner {
    pub chat: Arc<dyn ChatStream>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub connection: Arc<SerializedConnection>,
    pub voice: Arc<TtsProfile>,
    pub persona: Option<String>,
    pub config: PipelineConfig,
}

impl TurnRunner {
    /// Drains the turn queue until it closes or `root` is cancelled.
    ///
    /// Turn failures are reported to the client and the loop moves on; only
    /// a dead connection ends it early, and then `root` is cancelled too.
    pub async fn work(
        self,
        mut queue: mpsc::Receiver<Work>,
        root: CancellationToken,
    ) -> Result<(), PipelineError> {
        loop {
            let work = tokio::select! {
                _ = root.cancelled() => return Ok(()),
                work = queue.recv() => work,
            };
            let Some(work) = work else { return Ok(()) };

            let outcome = match work {
                Work::Text { turn, cancel } => self.run(turn, &cancel).await,
                Work::Voice {
                    transcript,
                    options,
                    cancel,
                } => self.run_voice(transcript, options, &cancel).await,
            };
            if let Err(err) = outcome {
                if let Err(fatal) = report(&self.connection, err).await {
                    tracing::info!(connection = %self.connection.id(), error = %fatal, "connection lost during turn");
                    root.cancel();
                    return Err(fatal);
                }
            }
        }
    }

    async fn run_voice(
        &self,
        transcript: PendingTranscript,
        options: TurnOptions,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            text = transcript.wait() => text?,
        };
        if text.trim().is_empty() {
            tracing::debug!(connection = %self.connection.id(), "empty transcript, no turn");
            return Ok(());
        }
        self.run(options.into_turn(text), cancel).await
    }

    /// Runs one turn to completion.
    pub async fn run(
        &self,
        turn: ConversationTurn,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        turn.validate(self.config.max_context_messages)?;
        tracing::info!(
            connection = %self.connection.id(),
            stream = turn.stream,
            search = turn.enable_search,
            history = turn.messages.len(),
            "turn started"
        );

        let request =
            ChatRequest::new(turn.prompt(self.persona.as_deref())).with_search(turn.enable_search);
        if turn.stream {
            self.stream(request, cancel).await
        } else {
            self.complete(request, cancel).await
        }
    }

    async fn complete(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let response = self
            .chat
            .complete(&request, cancel)
            .await
            .map_err(PipelineError::generation)?;
        self.connection
            .send_event(&ClientEvent::text_response(response))
            .await?;
        Ok(())
    }

    /// Generation and synthesis as one supervised group joined by the
    /// handoff queue. `stream_end` follows the last audio frame.
    async fn stream(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.connection
            .send_event(&ClientEvent::stream_start())
            .await?;

        let mut group = TaskGroup::new(cancel);
        let token = group.token();
        let (handoff, queued) =
            handoff::channel(self.config.handoff_capacity, self.voice.clone(), token.clone());
        let (response_tx, response_rx) = oneshot::channel();

        let sink = TurnSink::new(
            self.connection.clone(),
            handoff,
            Segmenter::new(self.config.segment_min_chars),
        );
        let chat = self.chat.clone();
        let generation_token = token.clone();
        group.spawn(async move {
            let response = generate(chat, request, sink, generation_token).await?;
            let _ = response_tx.send(response);
            Ok(())
        });
        group.spawn(synthesize(
            self.synthesizer.clone(),
            queued,
            self.connection.clone(),
            token,
        ));
        group.wait().await?;

        let response = response_rx.await.map_err(|_| PipelineError::Cancelled)?;
        self.connection
            .send_event(&ClientEvent::stream_end(response))
            .await?;
        Ok(())
    }
}

/// Chunk sink of a streamed turn: every chunk goes to the client at once
/// and, segmented, to the synthesis queue.
struct TurnSink {
    connection: Arc<SerializedConnection>,
    handoff: HandoffSender,
    segmenter: Segmenter,
    response: String,
    /// Why the sink refused a chunk.
    failure: Option<PipelineError>,
}

impl TurnSink {
    fn new(
        connection: Arc<SerializedConnection>,
        handoff: HandoffSender,
        segmenter: Segmenter,
    ) -> Self {
        Self {
            connection,
            handoff,
            segmenter,
            response: String::new(),
            failure: None,
        }
    }

    fn veto(&mut self, err: PipelineError) -> SinkError {
        let refusal = SinkError::new(err.to_string());
        self.failure = Some(err);
        refusal
    }
}

#[async_trait]
impl ChunkSink for TurnSink {
    async fn send_chunk(&mut self, chunk: &str) -> Result<(), SinkError> {
        self.response.push_str(chunk);
        if let Err(err) = self
            .connection
            .send_event(&ClientEvent::stream_chunk(chunk))
            .await
        {
            return Err(self.veto(err.into()));
        }
        if let Some(segment) = self.segmenter.push(chunk) {
            if let Err(err) = self.handoff.push(segment).await {
                return Err(self.veto(err));
            }
        }
        Ok(())
    }
}

/// Streams the completion and returns the full text. The handoff queue
/// closes when this returns, whatever the outcome.
async fn generate(
    chat: Arc<dyn ChatStream>,
    request: ChatRequest,
    mut sink: TurnSink,
    cancel: CancellationToken,
) -> Result<String, PipelineError> {
    match chat.stream_chat(&request, &mut sink, &cancel).await {
        Ok(()) => {}
        Err(LlmError::Sink(_)) => {
            return Err(sink.failure.take().unwrap_or(PipelineError::Cancelled));
        }
        Err(err) => return Err(PipelineError::generation(err)),
    }

    if let Some(rest) = sink.segmenter.finish() {
        sink.handoff.push(rest).await?;
    }
    tracing::debug!(
        connection = %sink.connection.id(),
        segments = sink.handoff.pushed(),
        "generation finished"
    );
    Ok(sink.response)
}

/// Feeds queued segments, in sequence order, into one synthesis session.
/// No session is opened for a turn that produced no text.
async fn synthesize(
    synthesizer: Arc<dyn Synthesizer>,
    mut queued: HandoffReceiver,
    connection: Arc<SerializedConnection>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        task = queued.recv() => task,
    };
    let Some(first) = first else { return Ok(()) };
    let voice = first.voice.clone();

    let (fragments, incoming) = mpsc::channel(1);
    let feed = async move {
        let mut next = Some(first);
        while let Some(task) = next {
            if task.cancel.is_cancelled() || fragments.send(task.text).await.is_err() {
                break;
            }
            next = queued.recv().await;
        }
        Ok::<_, PipelineError>(())
    };
    let speak = async {
        synthesizer
            .synthesize(&voice, incoming, &*connection, &cancel)
            .await
            .map_err(PipelineError::synthesis)
    };

    tokio::try_join!(feed, speak)?;
    Ok(())
}
