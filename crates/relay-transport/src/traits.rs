//! Connection contract for Relay.
//!
//! A connection is a live duplex endpoint the relay can push messages to.
//! Every outbound message goes through a [`MessageWriter`]: opened with
//! [`Connection::next_writer`], fed with possibly-partial writes, then
//! finished. The server only ever sees `Arc<dyn Connection>`.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Atomic counter so IDs generated within the same nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
///
/// Only used for logging; connections themselves are compared by reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of an outbound message.
///
/// Values are the RFC 6455 opcodes. Only `Text` and `Binary` are published
/// in normal operation; the control kinds exist so the contract can carry
/// every frame a WebSocket can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// UTF-8 text data.
    Text = 1,
    /// Arbitrary binary data.
    Binary = 2,
    /// Close control frame. Payload is empty or a status code plus reason.
    Close = 8,
    /// Ping control frame.
    Ping = 9,
    /// Pong control frame.
    Pong = 10,
}

impl MessageKind {
    /// Whether this is a control frame kind.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Lowercase name, used as a metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            other => Err(TransportError::InvalidPayload(format!(
                "unknown message opcode {other}"
            ))),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Payload cannot be carried by the requested message kind.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A write accepted no bytes of a non-empty buffer.
    #[error("Write accepted zero bytes")]
    WriteZero,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A single-use destination for one outbound message.
///
/// `write` may accept fewer bytes than offered, so callers keep writing the
/// remainder until the whole payload is taken. The message is only sent once
/// [`finish`](MessageWriter::finish) succeeds; dropping an unfinished writer
/// abandons the message.
#[async_trait]
pub trait MessageWriter: Send {
    /// Write a chunk, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Finalize and flush the message frame.
    async fn finish(self: Box<Self>) -> Result<(), TransportError>;
}

/// An active connection the relay delivers messages to.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Obtain a writer for the next outbound message of the given kind.
    ///
    /// The writer holds the connection's send side until it is finished or
    /// dropped, so messages from concurrent callers never interleave.
    async fn next_writer(
        &self,
        kind: MessageKind,
    ) -> Result<Box<dyn MessageWriter>, TransportError>;

    /// Close the connection permanently.
    ///
    /// Implementations are not required to be idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_message_kind_opcodes() {
        assert_eq!(u8::from(MessageKind::Text), 1);
        assert_eq!(u8::from(MessageKind::Pong), 10);
        assert_eq!(MessageKind::try_from(2).unwrap(), MessageKind::Binary);
        assert_eq!(MessageKind::try_from(8).unwrap(), MessageKind::Close);
        assert!(MessageKind::try_from(3).is_err());
    }

    #[test]
    fn test_message_kind_control() {
        assert!(!MessageKind::Text.is_control());
        assert!(!MessageKind::Binary.is_control());
        assert!(MessageKind::Ping.is_control());
        assert!(MessageKind::Close.is_control());
    }
}
