//! Client socket wrapper with a single writer and a heartbeat.
//!
//! Several tasks write to one client socket during a turn (text chunks,
//! synthesized audio, recognition results, pings). [`SerializedConnection`]
//! funnels all of them through one bounded queue drained by one writer task,
//! so frames reach the wire whole and in enqueue order. The first write
//! failure closes the connection and is cached for every later caller.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use echome_types::{ClientEvent, SinkError};
use echome_voice::AudioSink;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One WebSocket frame, independent of the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("no frame from peer within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode event: {0}")]
    Encode(String),
}

fn default_queue_capacity() -> usize {
    100
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    25
}

/// Write queue and heartbeat settings for client sockets.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound on a single frame write.
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,

    /// Longest the peer may stay silent. Any inbound frame resets it.
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl ConnectionSettings {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

type FrameSink = Pin<Box<dyn Sink<Frame, Error = String> + Send>>;

struct Shared {
    /// Cancelled once the connection stops accepting writes.
    closing: CancellationToken,
    /// Cancelled when the writer task exits, whatever the reason.
    drained: CancellationToken,
    /// First reason the connection stopped.
    failure: OnceLock<ConnectionError>,
    /// Writer outcome, returned by every `close` call.
    outcome: OnceLock<Result<(), ConnectionError>>,
}

impl Shared {
    fn fail(&self, err: ConnectionError) {
        let _ = self.failure.set(err);
        self.closing.cancel();
    }

    fn reason(&self) -> ConnectionError {
        self.failure.get().cloned().unwrap_or(ConnectionError::Closed)
    }
}

struct Inbound {
    stream: BoxStream<'static, Result<Frame, String>>,
    deadline: Instant,
}

/// A client socket that many tasks may write to concurrently.
///
/// Must be created inside a Tokio runtime: construction spawns the writer
/// and heartbeat tasks.
pub struct SerializedConnection {
    id: Uuid,
    settings: ConnectionSettings,
    queue: mpsc::Sender<Frame>,
    inbound: tokio::sync::Mutex<Inbound>,
    shared: Arc<Shared>,
}

impl SerializedConnection {
    /// Wraps any frame sink and stream pair.
    pub fn new<S, R, E>(sink: S, stream: R, settings: ConnectionSettings) -> Self
    where
        S: Sink<Frame> + Send + 'static,
        S::Error: fmt::Display,
        R: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: fmt::Display,
    {
        let id = Uuid::new_v4();
        let sink: FrameSink = Box::pin(sink.sink_map_err(|e| e.to_string()));
        let stream = stream.map(|frame| frame.map_err(|e| e.to_string())).boxed();

        let shared = Arc::new(Shared {
            closing: CancellationToken::new(),
            drained: CancellationToken::new(),
            failure: OnceLock::new(),
            outcome: OnceLock::new(),
        });
        let (queue, pending) = mpsc::channel(settings.queue_capacity.max(1));

        tokio::spawn(write_frames(
            id,
            sink,
            pending,
            shared.clone(),
            settings.write_wait(),
        ));
        tokio::spawn(heartbeat(
            queue.clone(),
            shared.closing.clone(),
            settings.ping_interval(),
        ));

        tracing::debug!(connection = %id, "client connection opened");
        Self {
            id,
            settings,
            queue,
            inbound: tokio::sync::Mutex::new(Inbound {
                stream,
                deadline: Instant::now() + settings.pong_wait(),
            }),
            shared,
        }
    }

    /// Wraps an upgraded axum socket.
    pub fn from_axum(socket: WebSocket, settings: ConnectionSettings) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink.with(|frame: Frame| async move { Ok::<_, axum::Error>(Message::from(frame)) });
        let stream = stream.map(|message| message.map(Frame::from));
        Self::new(sink, stream, settings)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queues `frame` for the writer. Waits only for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns the cached close reason once the connection stopped.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.shared.closing.is_cancelled() {
            return Err(self.shared.reason());
        }
        tokio::select! {
            biased;
            _ = self.shared.closing.cancelled() => Err(self.shared.reason()),
            sent = self.queue.send(frame) => sent.map_err(|_| self.shared.reason()),
        }
    }

    /// Serializes `event` and queues it as a text frame.
    pub async fn send_event(&self, event: &ClientEvent) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(event).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.send(Frame::Text(text)).await
    }

    /// Next text or binary frame from the peer.
    ///
    /// Ping and pong frames are consumed here; every inbound frame pushes
    /// the read deadline out by `pong_wait`. A missed deadline closes the
    /// connection with [`ConnectionError::HeartbeatTimeout`].
    pub async fn receive(&self) -> Result<Frame, ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let deadline = inbound.deadline;
            let next = tokio::select! {
                _ = self.shared.closing.cancelled() => return Err(self.shared.reason()),
                next = tokio::time::timeout_at(deadline, inbound.stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    let err = ConnectionError::HeartbeatTimeout(self.settings.pong_wait());
                    tracing::info!(connection = %self.id, "peer missed heartbeat deadline");
                    return Err(self.fail(err));
                }
                Ok(None) | Ok(Some(Ok(Frame::Close))) => {
                    return Err(self.fail(ConnectionError::PeerClosed));
                }
                Ok(Some(Err(reason))) => {
                    return Err(self.fail(ConnectionError::Transport(reason)));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            inbound.deadline = Instant::now() + self.settings.pong_wait();
            match frame {
                Frame::Text(_) | Frame::Binary(_) => return Ok(frame),
                Frame::Ping(_) | Frame::Pong(_) | Frame::Close => continue,
            }
        }
    }

    fn fail(&self, err: ConnectionError) -> ConnectionError {
        self.shared.fail(err);
        self.shared.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    /// Resolves once the connection stopped accepting writes.
    pub async fn closed(&self) {
        self.shared.closing.cancelled().await
    }

    /// Stops accepting writes, lets the writer drain what is queued and
    /// closes the socket.
    ///
    /// Safe to call any number of times from any task; every call returns
    /// the same result, the first write error if there was one.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.shared.closing.cancel();
        self.shared.drained.cancelled().await;
        match self.shared.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(ConnectionError::Transport(
                "writer task stopped unexpectedly".to_string(),
            )),
        }
    }
}

impl Drop for SerializedConnection {
    fn drop(&mut self) {
        self.shared.closing.cancel();
    }
}

#[async_trait]
impl AudioSink for SerializedConnection {
    async fn send_audio(&self, audio: Bytes) -> Result<(), SinkError> {
        self.send(Frame::Binary(audio))
            .await
            .map_err(|e| SinkError::new(e.to_string()))
    }
}

async fn write_frames(
    id: Uuid,
    mut sink: FrameSink,
    mut pending: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    write_wait: Duration,
) {
    let _drained = shared.drained.clone().drop_guard();

    loop {
        let next = tokio::select! {
            frame = pending.recv() => frame,
            _ = shared.closing.cancelled() => {
                pending.close();
                pending.recv().await
            }
        };
        let Some(frame) = next else { break };

        if let Err(err) = write(&mut sink, frame, write_wait).await {
            tracing::warn!(connection = %id, error = %err, "client write failed, closing connection");
            pending.close();
            shared.fail(err.clone());
            let _ = shared.outcome.set(Err(err));
            return;
        }
    }

    if let Err(err) = write(&mut sink, Frame::Close, write_wait).await {
        tracing::debug!(connection = %id, error = %err, "close frame not delivered");
    }
    match tokio::time::timeout(write_wait, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => tracing::debug!(connection = %id, %reason, "socket close failed"),
        Err(_) => tracing::debug!(connection = %id, "socket close timed out"),
    }
    tracing::debug!(connection = %id, "client connection closed");
    let _ = shared.outcome.set(Ok(()));
}

async fn write(sink: &mut FrameSink, frame: Frame, wait: Duration) -> Result<(), ConnectionError> {
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(ConnectionError::Transport(reason)),
        Err(_) => Err(ConnectionError::WriteTimeout(wait)),
    }
}

async fn heartbeat(queue: mpsc::Sender<Frame>, closing: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = ticker.tick() => {
                if queue.send(Frame::Ping(Bytes::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}
