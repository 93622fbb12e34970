//! Published message type for Relay.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tenvis_relay_transport::MessageKind;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (unix_nanos() as u64).wrapping_add(counter)
}

/// A message to fan out to every subscriber.
///
/// Immutable once built. The payload is reference counted, so every
/// broadcast worker reads the same buffer.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// How subscribers should interpret the payload.
    pub kind: MessageKind,
    /// Message payload.
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            payload: payload.into(),
            timestamp: (unix_nanos() / 1_000_000) as u64,
        }
    }

    /// Create a text message.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Text, payload)
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
