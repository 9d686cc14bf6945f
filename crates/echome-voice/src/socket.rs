//! Upstream WebSocket plumbing shared by recognition and synthesis.

use crate::config::SocketTimeouts;
use crate::error::VoiceError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half with a per-write deadline.
pub(crate) struct UpstreamWriter {
    sink: SplitSink<Upstream, Message>,
    write_timeout: Duration,
}

/// Read half with an idle deadline.
pub(crate) struct UpstreamReader {
    stream: SplitStream<Upstream>,
}

/// Opens an upstream socket with the given extra headers.
pub(crate) async fn connect(
    url: &str,
    headers: &[(&'static str, String)],
    timeouts: SocketTimeouts,
) -> Result<(UpstreamWriter, UpstreamReader), VoiceError> {
    let connect_err = |reason: String| VoiceError::Connect {
        url: url.to_string(),
        reason,
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| connect_err(e.to_string()))?;
    for (name, value) in headers {
        let value = HeaderValue::from_str(value).map_err(|e| connect_err(e.to_string()))?;
        request.headers_mut().insert(*name, value);
    }

    let (socket, _response) =
        tokio::time::timeout(timeouts.connect, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| connect_err(format!("no handshake within {:?}", timeouts.connect)))?
            .map_err(|e| connect_err(e.to_string()))?;

    tracing::debug!(%url, "upstream socket connected");
    let (sink, stream) = socket.split();
    Ok((
        UpstreamWriter {
            sink,
            write_timeout: timeouts.write,
        },
        UpstreamReader { stream },
    ))
}

impl UpstreamWriter {
    pub async fn send(&mut self, message: Message) -> Result<(), VoiceError> {
        match tokio::time::timeout(self.write_timeout, self.sink.send(message)).await {
            Ok(result) => result.map_err(VoiceError::from),
            Err(_) => Err(VoiceError::Timeout {
                during: "writing to the upstream",
                after: self.write_timeout,
            }),
        }
    }

    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), VoiceError> {
        let text = serde_json::to_string(value)?;
        self.send(Message::text(text)).await
    }

    pub async fn ping(&mut self) -> Result<(), VoiceError> {
        self.send(Message::Ping(Default::default())).await
    }

    /// Sends a close frame. Errors are ignored; the session is over anyway.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.write_timeout, self.sink.close()).await;
    }
}

impl UpstreamReader {
    /// Next text or binary frame. `Ok(None)` means the upstream closed.
    pub async fn next(
        &mut self,
        idle: Duration,
        during: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, VoiceError> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                next = tokio::time::timeout(idle, self.stream.next()) => next,
            };
            let frame = match next {
                Err(_) => return Err(VoiceError::Timeout { during, after: idle }),
                Ok(None) => return Ok(None),
                Ok(Some(frame)) => frame?,
            };
            match frame {
                Message::Text(_) | Message::Binary(_) => return Ok(Some(frame)),
                Message::Close(reason) => {
                    tracing::debug!(?reason, "upstream sent close");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
