//! In-memory connection.
//!
//! Records every delivered message instead of putting it on a wire. Failures,
//! partial writes, slow writes and concurrency probing can be scripted, which
//! makes it the stand-in for real sockets in tests and benchmarks.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::traits::{Connection, ConnectionId, MessageKind, MessageWriter, TransportError};

/// Delivery step a [`MemoryConnection`] can be told to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    /// `next_writer`.
    OpenWriter,
    /// Every `write` call.
    Write,
    /// `finish`.
    Finish,
    /// `close`.
    Close,
}

/// A message as seen by the receiving end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Kind the writer was opened with.
    pub kind: MessageKind,
    /// Concatenation of all accepted chunks.
    pub payload: Bytes,
    /// Size of each accepted chunk, in order.
    pub chunks: Vec<usize>,
}

/// Counts how many writers are open at once across connections.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    entries: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Create a shareable probe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneously open writers observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Writers currently open.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Total writers ever opened.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.entries.fetch_add(1, Ordering::SeqCst);
        ProbeGuard(Some(Arc::clone(self)))
    }
}

/// Leaves the probe when the writer is finished or dropped.
struct ProbeGuard(Option<Arc<ConcurrencyProbe>>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(probe) = self.0.take() {
            probe.current.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
    is_open: AtomicBool,
    failure: Option<(FailAt, String)>,
    max_chunk: usize,
    write_delay: Option<Duration>,
    close_delay: Option<Duration>,
    probe: Option<Arc<ConcurrencyProbe>>,
    writers_opened: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemoryConnection {
    /// Create a connection that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ConnectionId::generate(),
            received: Arc::new(Mutex::new(Vec::new())),
            is_open: AtomicBool::new(true),
            failure: None,
            max_chunk: usize::MAX,
            write_delay: None,
            close_delay: None,
            probe: None,
            writers_opened: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Use a fixed connection ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ConnectionId>) -> Self {
        self.id = id.into();
        self
    }

    /// Fail at `step` with `TransportError::Other(message)`.
    #[must_use]
    pub fn fail_at(mut self, step: FailAt, message: impl Into<String>) -> Self {
        self.failure = Some((step, message.into()));
        self
    }

    /// Accept at most `max` bytes per `write` call.
    #[must_use]
    pub fn max_chunk(mut self, max: usize) -> Self {
        self.max_chunk = max.max(1);
        self
    }

    /// Sleep for `delay` inside every `write` call.
    #[must_use]
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Sleep for `delay` inside `close`, after the connection stops accepting writers.
    #[must_use]
    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    /// Report open writers to `probe`.
    #[must_use]
    pub fn probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Messages delivered so far.
    pub async fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock().await.clone()
    }

    /// Number of `next_writer` calls.
    #[must_use]
    pub fn writers_opened(&self) -> usize {
        self.writers_opened.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn failure_at(&self, step: FailAt) -> Option<TransportError> {
        match &self.failure {
            Some((at, message)) if *at == step => Some(TransportError::Other(message.clone())),
            _ => None,
        }
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn next_writer(
        &self,
        kind: MessageKind,
    ) -> Result<Box<dyn MessageWriter>, TransportError> {
        self.writers_opened.fetch_add(1, Ordering::SeqCst);

        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(err) = self.failure_at(FailAt::OpenWriter) {
            return Err(err);
        }

        let guard = match &self.probe {
            Some(probe) => probe.enter(),
            None => ProbeGuard(None),
        };

        Ok(Box::new(MemoryWriter {
            kind,
            buffer: BytesMut::new(),
            chunks: Vec::new(),
            received: Arc::clone(&self.received),
            write_error: self.failure_at(FailAt::Write).map(|e| e.to_string()),
            finish_error: self.failure_at(FailAt::Finish),
            max_chunk: self.max_chunk,
            write_delay: self.write_delay,
            _guard: guard,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.is_open.store(false, Ordering::SeqCst);

        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }

        match self.failure_at(FailAt::Close) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

struct MemoryWriter {
    kind: MessageKind,
    buffer: BytesMut,
    chunks: Vec<usize>,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
    write_error: Option<String>,
    finish_error: Option<TransportError>,
    max_chunk: usize,
    write_delay: Option<Duration>,
    _guard: ProbeGuard,
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.write_error {
            return Err(TransportError::Other(message.clone()));
        }

        let accepted = buf.len().min(self.max_chunk);
        self.buffer.extend_from_slice(&buf[..accepted]);
        self.chunks.push(accepted);
        Ok(accepted)
    }

    async fn finish(mut self: Box<Self>) -> Result<(), TransportError> {
        if let Some(err) = self.finish_error.take() {
            return Err(err);
        }

        let message = ReceivedMessage {
            kind: self.kind,
            payload: self.buffer.split().freeze(),
            chunks: std::mem::take(&mut self.chunks),
        };
        self.received.lock().await.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_chunked_message() {
        let conn = MemoryConnection::new().max_chunk(3);

        let mut writer = conn.next_writer(MessageKind::Text).await.unwrap();
        assert_eq!(writer.write(b"hi there").await.unwrap(), 3);
        assert_eq!(writer.write(b"there").await.unwrap(), 3);
        assert_eq!(writer.write(b"re").await.unwrap(), 2);
        writer.finish().await.unwrap();

        let received = conn.received().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, MessageKind::Text);
        assert_eq!(&received[0].payload[..], b"hi there");
        assert_eq!(received[0].chunks, vec![3, 3, 2]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let conn = MemoryConnection::new().fail_at(FailAt::OpenWriter, "bad thing");
        let err = conn.next_writer(MessageKind::Text).await.err().unwrap();
        assert_eq!(err.to_string(), "bad thing");

        let conn = MemoryConnection::new().fail_at(FailAt::Close, "stuck");
        assert!(conn.close().await.is_err());
        assert_eq!(conn.close_calls(), 1);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_probe_tracks_open_writers() {
        let probe = ConcurrencyProbe::new();
        let a = MemoryConnection::new().probe(Arc::clone(&probe));
        let b = MemoryConnection::new().probe(Arc::clone(&probe));

        let wa = a.next_writer(MessageKind::Binary).await.unwrap();
        let wb = b.next_writer(MessageKind::Binary).await.unwrap();
        assert_eq!(probe.current(), 2);

        wa.finish().await.unwrap();
        drop(wb);
        assert_eq!(probe.current(), 0);
        assert_eq!(probe.peak(), 2);
        assert_eq!(probe.entries(), 2);
    }
}
