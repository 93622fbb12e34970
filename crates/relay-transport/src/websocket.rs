//! WebSocket transport implementation.
//!
//! This module adapts the send half of an axum [`WebSocket`] to the
//! [`Connection`] contract. The adapter is generic over the sink so it can be
//! driven by anything that accepts axum [`Message`]s.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, MessageKind, MessageWriter, TransportError};

/// Default number of bytes a writer accepts per `write` call.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 1024;

/// Largest payload a control frame may carry (RFC 6455 section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Send half of an axum WebSocket.
pub type WebSocketSink = SplitSink<WebSocket, Message>;

/// WebSocket adapter configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum bytes accepted by a single `write` call.
    pub write_chunk_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }
}

/// A WebSocket connection.
pub struct WsConnection<S = WebSocketSink> {
    id: ConnectionId,
    sink: Arc<Mutex<S>>,
    is_open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    write_chunk_size: usize,
}

impl WsConnection<WebSocketSink> {
    /// Split an upgraded socket into a connection and its inbound stream.
    ///
    /// The relay never reads from subscribers, but the stream still has to be
    /// polled for close frames and pings.
    #[must_use]
    pub fn from_socket(socket: WebSocket, config: &WebSocketConfig) -> (Self, SplitStream<WebSocket>) {
        let (sink, stream) = socket.split();
        (Self::new(sink, config), stream)
    }
}

impl<S> WsConnection<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    /// Create a new WebSocket connection over `sink`.
    #[must_use]
    pub fn new(sink: S, config: &WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            sink: Arc::new(Mutex::new(sink)),
            is_open: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(Notify::new()),
            write_chunk_size: config.write_chunk_size.max(1),
        }
    }

    /// Record that the peer went away.
    ///
    /// Later writers fail fast with [`TransportError::ConnectionClosed`]
    /// instead of attempting a send on a dead socket.
    pub fn mark_closed(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            self.closed.notify_waiters();
            debug!(connection = %self.id, "Peer closed connection");
        }
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn next_writer(
        &self,
        kind: MessageKind,
    ) -> Result<Box<dyn MessageWriter>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let sink = Arc::clone(&self.sink).lock_owned().await;

        // The connection may have been closed while we waited for the sink.
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        Ok(Box::new(WsMessageWriter {
            sink,
            kind,
            buffer: BytesMut::new(),
            chunk_size: self.write_chunk_size,
            is_open: Arc::clone(&self.is_open),
            closed: Arc::clone(&self.closed),
            id: self.id.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }
        // Release the sink from a writer stuck on a peer that stopped reading.
        self.closed.notify_waiters();

        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to send close frame: {}", e)))?;
        sink.close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Writer for one outbound WebSocket message.
///
/// Holds the connection's sink for its whole lifetime and sends a single
/// message on `finish`. A pending send gives up when the connection closes.
struct WsMessageWriter<S> {
    sink: OwnedMutexGuard<S>,
    kind: MessageKind,
    buffer: BytesMut,
    chunk_size: usize,
    is_open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    id: ConnectionId,
}

#[async_trait]
impl<S> MessageWriter for WsMessageWriter<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let accepted = buf.len().min(self.chunk_size);
        self.buffer.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    async fn finish(mut self: Box<Self>) -> Result<(), TransportError> {
        let payload = self.buffer.split().to_vec();
        let size = payload.len();
        let message = to_ws_message(self.kind, payload)?;

        let notify = Arc::clone(&self.closed);
        let closed = notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let sent = tokio::select! {
            sent = self.sink.send(message) => sent.map_err(|e| e.to_string()),
            _ = &mut closed => return Err(TransportError::ConnectionClosed),
        };
        if let Err(e) = sent {
            self.is_open.store(false, Ordering::SeqCst);
            return Err(TransportError::SendFailed(e));
        }

        trace!(connection = %self.id, kind = %self.kind, bytes = size, "Message sent");
        Ok(())
    }
}

/// Build the WebSocket message carrying `payload` as `kind`.
fn to_ws_message(kind: MessageKind, payload: Vec<u8>) -> Result<Message, TransportError> {
    if kind.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(TransportError::InvalidPayload(format!(
            "{} payload of {} bytes exceeds {}",
            kind,
            payload.len(),
            MAX_CONTROL_PAYLOAD
        )));
    }

    match kind {
        MessageKind::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| TransportError::InvalidPayload("text payload is not valid UTF-8".into())),
        MessageKind::Binary => Ok(Message::Binary(payload)),
        MessageKind::Ping => Ok(Message::Ping(payload)),
        MessageKind::Pong => Ok(Message::Pong(payload)),
        MessageKind::Close => close_message(&payload),
    }
}

/// Parse a close payload: empty, or a big-endian status code and a reason.
fn close_message(payload: &[u8]) -> Result<Message, TransportError> {
    match payload {
        [] => Ok(Message::Close(None)),
        [_] => Err(TransportError::InvalidPayload(
            "close payload must carry a two byte status code".into(),
        )),
        [hi, lo, reason @ ..] => {
            let reason = std::str::from_utf8(reason).map_err(|_| {
                TransportError::InvalidPayload("close reason is not valid UTF-8".into())
            })?;
            Ok(Message::Close(Some(CloseFrame {
                code: u16::from_be_bytes([*hi, *lo]),
                reason: reason.to_owned().into(),
            })))
        }
    }
}
