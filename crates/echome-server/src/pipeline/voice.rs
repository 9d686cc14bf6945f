//! Client audio in, transcripts out.

use super::PipelineError;
use crate::connection::SerializedConnection;
use bytes::Bytes;
use echome_types::ClientEvent;
use echome_voice::Recognizer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TRANSCRIPT_QUEUE: usize = 16;

/// A recognition session fed by the client's binary frames.
///
/// Every result is relayed to the client as `asr_result`; settled sentences
/// are joined into the transcript, which becomes the next turn.
pub(crate) struct VoiceInput {
    audio: mpsc::Sender<Bytes>,
    task: JoinHandle<Result<String, PipelineError>>,
    cancel: CancellationToken,
}

impl VoiceInput {
    pub fn start(
        recognizer: Arc<dyn Recognizer>,
        connection: Arc<SerializedConnection>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (audio, incoming) = mpsc::channel(capacity.max(1));
        tracing::debug!(connection = %connection.id(), "opening recognition session");
        let task = tokio::spawn(recognize(recognizer, incoming, connection, cancel.clone()));
        Self {
            audio,
            task,
            cancel,
        }
    }

    /// Forwards one audio frame. False once the session ended on its own.
    pub async fn push(&self, chunk: Bytes) -> bool {
        self.audio.send(chunk).await.is_ok()
    }

    /// Ends the audio input; the session flushes and finishes upstream.
    pub fn finish(self) -> PendingTranscript {
        drop(self.audio);
        PendingTranscript { task: self.task }
    }

    /// Drops the session without waiting for a transcript.
    pub fn abort(self) {
        self.cancel.cancel();
    }
}

/// Transcript of a session whose input already ended.
pub(crate) struct PendingTranscript {
    task: JoinHandle<Result<String, PipelineError>>,
}

impl PendingTranscript {
    pub async fn wait(self) -> Result<String, PipelineError> {
        self.task
            .await
            .unwrap_or_else(|e| Err(PipelineError::Join(e.to_string())))
    }
}

async fn recognize(
    recognizer: Arc<dyn Recognizer>,
    audio: mpsc::Receiver<Bytes>,
    connection: Arc<SerializedConnection>,
    cancel: CancellationToken,
) -> Result<String, PipelineError> {
    let (results, mut incoming) = mpsc::channel(TRANSCRIPT_QUEUE);

    let session = async {
        recognizer
            .recognize(audio, results, cancel.clone())
            .await
            .map_err(PipelineError::recognition)
    };
    let relay = async {
        let mut transcript = String::new();
        while let Some(result) = incoming.recv().await {
            connection
                .send_event(&ClientEvent::AsrResult {
                    text: result.text.clone(),
                    sentence_end: result.sentence_end,
                })
                .await?;
            if result.sentence_end {
                transcript.push_str(&result.text);
            }
        }
        Ok::<_, PipelineError>(transcript)
    };

    let ((), transcript) = tokio::try_join!(session, relay)?;
    connection.send_event(&ClientEvent::AsrFinished).await?;
    tracing::info!(
        connection = %connection.id(),
        chars = transcript.chars().count(),
        "recognition finished"
    );
    Ok(transcript)
}
