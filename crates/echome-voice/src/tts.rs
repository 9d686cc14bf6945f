use crate::asr::{await_task_started, task_failed};
use crate::config::{SocketTimeouts, TtsConfig, TtsProfile, TtsProtocol};
use crate::error::VoiceError;
use crate::protocol::{
    event_id, EventHeader, RealtimeCommand, RealtimeEvent, RealtimeSession, TaskCommand,
    TaskEvent, TaskParameters,
};
use crate::session::{SessionEvent, SessionState, SessionTracker};
use crate::socket::{self, UpstreamReader, UpstreamWriter};
use async_trait::async_trait;
use bytes::Bytes;
use echome_types::SinkError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Receives synthesized audio, already decoded to raw bytes.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn send_audio(&self, audio: Bytes) -> Result<(), SinkError>;
}

/// Streaming speech synthesis.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesizes every fragment received on `fragments`, in order, within
    /// one upstream session. The session finishes once `fragments` closes
    /// and the upstream flushed the remaining audio.
    async fn synthesize(
        &self,
        profile: &TtsProfile,
        fragments: mpsc::Receiver<String>,
        audio: &dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError>;
}

/// [`Synthesizer`] speaking both negotiation shapes, chosen per profile.
pub struct TtsAdapter {
    config: TtsConfig,
    api_key: String,
}

impl TtsAdapter {
    pub fn new(config: TtsConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    /// Synthesizes one complete text in a single request.
    pub async fn speak(
        &self,
        profile: &TtsProfile,
        text: &str,
        audio: &dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        match profile.protocol {
            TtsProtocol::RunTask => {
                let (_, fragments) = mpsc::channel(1);
                self.run_task_session(profile, Some(text.to_string()), fragments, audio, cancel)
                    .await
            }
            TtsProtocol::SessionUpdate => {
                let (tx, fragments) = mpsc::channel(1);
                // Capacity 1 and a fresh channel: this cannot fail.
                let _ = tx.try_send(text.to_string());
                drop(tx);
                self.session_update_session(profile, fragments, audio, cancel)
                    .await
            }
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("authorization", format!("Bearer {}", self.api_key)),
            ("x-dashscope-datainspection", "enable".to_string()),
        ]
    }

    async fn run_task_session(
        &self,
        profile: &TtsProfile,
        initial_text: Option<String>,
        fragments: mpsc::Receiver<String>,
        audio: &dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        let timeouts = self.config.timeouts();
        let (mut writer, mut reader) =
            socket::connect(&self.config.inference_url, &self.headers(), timeouts).await?;
        let task_id = Uuid::new_v4().to_string();
        let session = SessionTracker::new();

        let result: Result<(), VoiceError> = async {
            let run_task = TaskCommand::synthesis(
                &task_id,
                &profile.model,
                TaskParameters::Synthesis {
                    text_type: "PlainText",
                    voice: profile.voice.clone(),
                    format: profile.format.clone(),
                    sample_rate: profile.sample_rate,
                },
                initial_text,
            );
            writer.send_json(&run_task).await?;
            session.advance(SessionEvent::StartSent)?;
            await_task_started(&mut reader, &session, self.config.start_timeout(), cancel).await?;
            tracing::debug!(%task_id, model = %profile.model, voice = %profile.voice, "synthesis task started");

            let done = cancel.child_token();
            tokio::try_join!(
                send_task_fragments(&mut writer, fragments, &session, &task_id, &done, cancel, timeouts),
                read_task_audio(&mut reader, audio, &session, &done, cancel, timeouts),
            )?;
            Ok(())
        }
        .await;

        if result.is_err() {
            session.fail();
        }
        writer.close().await;
        result
    }

    async fn session_update_session(
        &self,
        profile: &TtsProfile,
        fragments: mpsc::Receiver<String>,
        audio: &dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        let timeouts = self.config.timeouts();
        let url = realtime_url(&self.config.realtime_url, &profile.model);
        let (mut writer, mut reader) = socket::connect(&url, &self.headers(), timeouts).await?;
        let session = SessionTracker::new();

        let result: Result<(), VoiceError> = async {
            let update = RealtimeCommand::SessionUpdate {
                event_id: event_id(),
                session: RealtimeSession {
                    mode: profile.mode.clone(),
                    voice: profile.voice.clone(),
                    language_type: "Auto",
                    language_hints: profile.language_hints.clone(),
                    format: profile.format.clone(),
                    sample_rate: profile.sample_rate,
                },
            };
            writer.send_json(&update).await?;
            session.advance(SessionEvent::StartSent)?;
            await_session_ack(&mut reader, &session, self.config.start_timeout(), cancel).await?;
            tracing::debug!(model = %profile.model, voice = %profile.voice, "realtime synthesis session ready");

            let done = cancel.child_token();
            tokio::try_join!(
                send_realtime_text(&mut writer, fragments, profile, &session, &done, cancel, timeouts),
                read_realtime_audio(&mut reader, audio, &session, &done, cancel, timeouts),
            )?;
            Ok(())
        }
        .await;

        if result.is_err() {
            session.fail();
        }
        writer.close().await;
        result
    }
}

#[async_trait]
impl Synthesizer for TtsAdapter {
    async fn synthesize(
        &self,
        profile: &TtsProfile,
        fragments: mpsc::Receiver<String>,
        audio: &dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        match profile.protocol {
            TtsProtocol::RunTask => {
                self.run_task_session(profile, None, fragments, audio, cancel)
                    .await
            }
            TtsProtocol::SessionUpdate => {
                self.session_update_session(profile, fragments, audio, cancel)
                    .await
            }
        }
    }
}

fn realtime_url(base: &str, model: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}model={}", base, separator, model)
}

fn finished_or_cancelled(cancel: &CancellationToken) -> Result<(), VoiceError> {
    if cancel.is_cancelled() {
        Err(VoiceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Next fragment, pinging the upstream while waiting. The outer `None` means
/// the session ended underneath us; the inner one means the input closed.
async fn next_fragment(
    fragments: &mut mpsc::Receiver<String>,
    writer: &mut UpstreamWriter,
    ping: &mut tokio::time::Interval,
    done: &CancellationToken,
) -> Result<Option<Option<String>>, VoiceError> {
    loop {
        tokio::select! {
            _ = done.cancelled() => return Ok(None),
            _ = ping.tick() => writer.ping().await?,
            fragment = fragments.recv() => return Ok(Some(fragment)),
        }
    }
}

async fn send_task_fragments(
    writer: &mut UpstreamWriter,
    mut fragments: mpsc::Receiver<String>,
    session: &SessionTracker,
    task_id: &str,
    done: &CancellationToken,
    cancel: &CancellationToken,
    timeouts: SocketTimeouts,
) -> Result<(), VoiceError> {
    let mut ping = keepalive(timeouts);
    let mut sent = 0u64;

    loop {
        match next_fragment(&mut fragments, writer, &mut ping, done).await? {
            None => return finished_or_cancelled(cancel),
            Some(Some(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                sent += 1;
                writer.send_json(&TaskCommand::continue_task(task_id, text)).await?;
            }
            Some(None) => break,
        }
    }

    if session.state().is_terminal() {
        return Ok(());
    }
    tracing::debug!(fragments = sent, "text input ended, finishing synthesis task");
    session.advance(SessionEvent::FinishSent)?;
    writer.send_json(&TaskCommand::finish_task(task_id)).await?;
    hold_until_done(writer, &mut ping, done, cancel).await
}

async fn read_task_audio(
    reader: &mut UpstreamReader,
    audio: &dyn AudioSink,
    session: &SessionTracker,
    done: &CancellationToken,
    cancel: &CancellationToken,
    timeouts: SocketTimeouts,
) -> Result<(), VoiceError> {
    let _done = done.clone().drop_guard();

    loop {
        let during = reading_phase(session);
        let Some(frame) = reader.next(timeouts.idle, during, cancel).await? else {
            return Err(VoiceError::UpstreamClosed);
        };
        let text = match frame {
            Message::Binary(data) => {
                audio.send_audio(data).await?;
                continue;
            }
            Message::Text(text) => text,
            _ => continue,
        };
        let event: TaskEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable synthesis event");
                continue;
            }
        };
        match event.header {
            EventHeader::TaskFinished { .. } => {
                session.advance(SessionEvent::Finished)?;
                return Ok(());
            }
            EventHeader::TaskFailed {
                error_code,
                error_message,
                ..
            } => {
                session.advance(SessionEvent::Failed)?;
                tracing::warn!(?error_code, ?error_message, "synthesis task failed");
                return Err(task_failed(error_code, error_message));
            }
            EventHeader::ResultGenerated { .. }
            | EventHeader::TaskStarted { .. }
            | EventHeader::Unknown => {}
        }
    }
}

/// Waits for `session.created` or `session.updated`.
async fn await_session_ack(
    reader: &mut UpstreamReader,
    session: &SessionTracker,
    within: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), VoiceError> {
    loop {
        let frame = reader
            .next(within, "waiting for session acknowledgement", cancel)
            .await?
            .ok_or(VoiceError::UpstreamClosed)?;
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<RealtimeEvent>(text.as_str()) {
            Ok(RealtimeEvent::SessionCreated {} | RealtimeEvent::SessionUpdated {}) => {
                session.advance(SessionEvent::Started)?;
                return Ok(());
            }
            Ok(RealtimeEvent::Error { error }) => {
                session.advance(SessionEvent::Failed)?;
                let error = error.unwrap_or_default();
                return Err(task_failed(error.code, error.message));
            }
            Ok(other) => tracing::debug!(event = ?other, "ignoring event before session ack"),
            Err(e) => tracing::warn!(error = %e, "skipping undecodable realtime event"),
        }
    }
}

async fn send_realtime_text(
    writer: &mut UpstreamWriter,
    mut fragments: mpsc::Receiver<String>,
    profile: &TtsProfile,
    session: &SessionTracker,
    done: &CancellationToken,
    cancel: &CancellationToken,
    timeouts: SocketTimeouts,
) -> Result<(), VoiceError> {
    let mut ping = keepalive(timeouts);

    loop {
        match next_fragment(&mut fragments, writer, &mut ping, done).await? {
            None => return finished_or_cancelled(cancel),
            Some(Some(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                writer
                    .send_json(&RealtimeCommand::AppendText {
                        event_id: event_id(),
                        text,
                    })
                    .await?;
                if profile.commits_manually() {
                    writer
                        .send_json(&RealtimeCommand::Commit {
                            event_id: event_id(),
                        })
                        .await?;
                }
            }
            Some(None) => break,
        }
    }

    if session.state().is_terminal() {
        return Ok(());
    }
    session.advance(SessionEvent::FinishSent)?;
    writer
        .send_json(&RealtimeCommand::Finish {
            event_id: event_id(),
        })
        .await?;
    hold_until_done(writer, &mut ping, done, cancel).await
}

async fn read_realtime_audio(
    reader: &mut UpstreamReader,
    audio: &dyn AudioSink,
    session: &SessionTracker,
    done: &CancellationToken,
    cancel: &CancellationToken,
    timeouts: SocketTimeouts,
) -> Result<(), VoiceError> {
    let _done = done.clone().drop_guard();

    loop {
        let during = reading_phase(session);
        let Some(frame) = reader.next(timeouts.idle, during, cancel).await? else {
            return Err(VoiceError::UpstreamClosed);
        };
        let text = match frame {
            Message::Binary(data) => {
                audio.send_audio(data).await?;
                continue;
            }
            Message::Text(text) => text,
            _ => continue,
        };
        let event = match serde_json::from_str::<RealtimeEvent>(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable realtime event");
                continue;
            }
        };
        if let Some(decoded) = event.audio() {
            match decoded {
                Ok(bytes) => audio.send_audio(Bytes::from(bytes)).await?,
                Err(e) => tracing::warn!(error = %e, "dropping audio delta with invalid base64"),
            }
            continue;
        }
        match event {
            RealtimeEvent::SessionFinished {} => {
                session.advance(SessionEvent::Finished)?;
                return Ok(());
            }
            RealtimeEvent::Error { error } => {
                session.advance(SessionEvent::Failed)?;
                let error = error.unwrap_or_default();
                tracing::warn!(code = ?error.code, message = ?error.message, "realtime synthesis failed");
                return Err(task_failed(error.code, error.message));
            }
            other => tracing::trace!(event = ?other, "realtime event"),
        }
    }
}

fn keepalive(timeouts: SocketTimeouts) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + timeouts.ping, timeouts.ping)
}

fn reading_phase(session: &SessionTracker) -> &'static str {
    if session.state() == SessionState::Finishing {
        "waiting for the remaining audio"
    } else {
        "waiting for synthesized audio"
    }
}

async fn hold_until_done(
    writer: &mut UpstreamWriter,
    ping: &mut tokio::time::Interval,
    done: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<(), VoiceError> {
    loop {
        tokio::select! {
            _ = done.cancelled() => return finished_or_cancelled(cancel),
            _ = ping.tick() => writer.ping().await?,
        }
    }
}
