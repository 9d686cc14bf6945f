use crate::config::AsrConfig;
use crate::error::VoiceError;
use crate::protocol::{EventHeader, TaskCommand, TaskEvent, TaskParameters};
use crate::session::{SessionEvent, SessionState, SessionTracker};
use crate::socket::{self, UpstreamReader, UpstreamWriter};
use async_trait::async_trait;
use bytes::Bytes;
use echome_types::SinkError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// True once the upstream settled this sentence.
    pub sentence_end: bool,
}

/// Streaming speech recognition.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Forwards `audio` upstream and delivers transcripts until the upstream
    /// finishes the task. Closing `audio` ends the input.
    async fn recognize(
        &self,
        audio: mpsc::Receiver<Bytes>,
        transcripts: mpsc::Sender<Transcript>,
        cancel: CancellationToken,
    ) -> Result<(), VoiceError>;
}

/// [`Recognizer`] over the duplex inference socket.
pub struct AsrAdapter {
    config: AsrConfig,
    api_key: String,
}

impl AsrAdapter {
    pub fn new(config: AsrConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("authorization", format!("bearer {}", self.api_key)),
            ("user-agent", "EchoMe/1.0".to_string()),
            ("x-dashscope-datainspection", "enable".to_string()),
        ]
    }

    fn run_task(&self, task_id: &str) -> TaskCommand {
        TaskCommand::recognition(
            task_id,
            &self.config.model,
            TaskParameters::Recognition {
                format: self.config.format.clone(),
                sample_rate: self.config.sample_rate,
                language_hints: self.config.language_hints.clone(),
                heartbeat: true,
            },
        )
    }
}

#[async_trait]
impl Recognizer for AsrAdapter {
    async fn recognize(
        &self,
        audio: mpsc::Receiver<Bytes>,
        transcripts: mpsc::Sender<Transcript>,
        cancel: CancellationToken,
    ) -> Result<(), VoiceError> {
        let timeouts = self.config.timeouts();
        let (mut writer, mut reader) =
            socket::connect(&self.config.url, &self.headers(), timeouts).await?;

        let task_id = Uuid::new_v4().to_string();
        let session = SessionTracker::new();

        let result: Result<(), VoiceError> = async {
            writer.send_json(&self.run_task(&task_id)).await?;
            session.advance(SessionEvent::StartSent)?;
            await_task_started(&mut reader, &session, timeouts.idle, &cancel).await?;
            tracing::info!(%task_id, model = %self.config.model, "recognition task started");

            // Set by the reader when the task ends so the writer stops
            // waiting for audio that no longer matters.
            let done = cancel.child_token();
            tokio::try_join!(
                forward_audio(&mut writer, audio, &session, &task_id, &done, &cancel, timeouts.ping),
                read_results(&mut reader, transcripts, &session, &done, &cancel, timeouts),
            )?;
            Ok(())
        }
        .await;

        if result.is_err() {
            session.fail();
        }
        writer.close().await;
        tracing::debug!(%task_id, state = ?session.state(), "recognition session ended");
        result
    }
}

/// Waits for `task-started`, surfacing `task-failed`.
pub(crate) async fn await_task_started(
    reader: &mut UpstreamReader,
    session: &SessionTracker,
    within: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), VoiceError> {
    loop {
        let frame = reader
            .next(within, "waiting for task-started", cancel)
            .await?
            .ok_or(VoiceError::UpstreamClosed)?;
        let Message::Text(text) = frame else {
            continue;
        };
        let event: TaskEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable upstream event");
                continue;
            }
        };
        match event.header {
            EventHeader::TaskStarted { .. } => {
                session.advance(SessionEvent::Started)?;
                return Ok(());
            }
            EventHeader::TaskFailed {
                error_code,
                error_message,
                ..
            } => {
                session.advance(SessionEvent::Failed)?;
                return Err(task_failed(error_code, error_message));
            }
            other => tracing::debug!(event = ?other, "ignoring event before task-started"),
        }
    }
}

pub(crate) fn task_failed(code: Option<String>, message: Option<String>) -> VoiceError {
    VoiceError::TaskFailed {
        code: code.unwrap_or_else(|| "unknown".to_string()),
        message: message.unwrap_or_else(|| "task failed".to_string()),
    }
}

async fn forward_audio(
    writer: &mut UpstreamWriter,
    mut audio: mpsc::Receiver<Bytes>,
    session: &SessionTracker,
    task_id: &str,
    done: &CancellationToken,
    cancel: &CancellationToken,
    ping_every: std::time::Duration,
) -> Result<(), VoiceError> {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = done.cancelled() => {
                return if cancel.is_cancelled() { Err(VoiceError::Cancelled) } else { Ok(()) };
            }
            _ = ping.tick() => writer.ping().await?,
            chunk = audio.recv() => match chunk {
                Some(chunk) => {
                    frames += 1;
                    writer.send(Message::Binary(chunk)).await?;
                }
                None => break,
            },
        }
    }

    tracing::debug!(frames, "audio input ended, finishing recognition task");
    if session.state().is_terminal() {
        return Ok(());
    }
    session.advance(SessionEvent::FinishSent)?;
    writer.send_json(&TaskCommand::finish_task(task_id)).await?;

    // Keep the socket alive until the reader sees the task end.
    loop {
        tokio::select! {
            _ = done.cancelled() => {
                return if cancel.is_cancelled() { Err(VoiceError::Cancelled) } else { Ok(()) };
            }
            _ = ping.tick() => writer.ping().await?,
        }
    }
}

async fn read_results(
    reader: &mut UpstreamReader,
    transcripts: mpsc::Sender<Transcript>,
    session: &SessionTracker,
    done: &CancellationToken,
    cancel: &CancellationToken,
    timeouts: crate::config::SocketTimeouts,
) -> Result<(), VoiceError> {
    let _done = done.clone().drop_guard();
    let mut results = 0u64;

    loop {
        let (idle, during) = if session.state() == SessionState::Finishing {
            (timeouts.finish, "waiting for task-finished")
        } else {
            (timeouts.idle, "waiting for recognition results")
        };
        let Some(frame) = reader.next(idle, during, cancel).await? else {
            return Err(VoiceError::UpstreamClosed);
        };
        let Message::Text(text) = frame else {
            continue;
        };
        let event: TaskEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable recognition event");
                continue;
            }
        };

        match &event.header {
            EventHeader::ResultGenerated { .. } => {
                let Some(sentence) = event.sentence() else {
                    continue;
                };
                if sentence.heartbeat || sentence.text.is_empty() {
                    continue;
                }
                results += 1;
                let transcript = Transcript {
                    text: sentence.text.clone(),
                    sentence_end: sentence.sentence_end,
                };
                transcripts
                    .send(transcript)
                    .await
                    .map_err(|_| SinkError::new("transcript receiver dropped"))?;
            }
            EventHeader::TaskFinished { .. } => {
                session.advance(SessionEvent::Finished)?;
                if results == 0 {
                    tracing::warn!("recognition finished without any result");
                }
                return Ok(());
            }
            EventHeader::TaskFailed {
                error_code,
                error_message,
                ..
            } => {
                session.advance(SessionEvent::Failed)?;
                tracing::error!(?error_code, ?error_message, "recognition task failed");
                return Err(task_failed(error_code.clone(), error_message.clone()));
            }
            EventHeader::TaskStarted { .. } | EventHeader::Unknown => {
                tracing::debug!(event = ?event.header, "ignoring recognition event");
            }
        }
    }
}
