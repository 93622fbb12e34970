//! Broadcast fan-out engine for Relay.
//!
//! One call to [`Broadcaster::broadcast`] delivers one message to every
//! registered connection through a fixed-width pool of workers:
//!
//! ```text
//!                 ┌──────────┐
//!  snapshot ────▶ │  queue   │ ──▶ worker 1 ──▶ conn, conn, ...
//!   (feeder)      │ (bounded)│ ──▶ worker 2 ──▶ conn, ...
//!                 └──────────┘ ──▶ worker k ──▶ conn, ...
//! ```
//!
//! The first worker to fail records its error and cancels the job; the
//! feeder and every other worker stop at their next check point.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tenvis_relay_transport::{Connection, ConnectionId, MessageKind, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::Message;
use crate::registry::{CloseReport, Registry, Sealed};

/// Invalid construction parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The worker pool must have at least one worker.
    #[error("concurrency must be greater than 0")]
    InvalidConcurrency,
}

/// Broadcast errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// A connection could not start a new message.
    #[error("failed to create writer for connection {connection}: {source}")]
    OpenWriter {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// Writing the payload to a connection failed.
    #[error("failed while writing to connection {connection}: {source}")]
    Write {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// Finalizing the message on a connection failed.
    #[error("failed to finish message for connection {connection}: {source}")]
    Finish {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// The broadcast was cancelled before every connection was served.
    #[error("Broadcast cancelled")]
    Cancelled,

    /// The broadcaster has been shut down.
    #[error("Broadcaster is closed")]
    Closed,

    /// A worker task panicked.
    #[error("Broadcast worker panicked: {0}")]
    WorkerPanicked(String),
}

impl BroadcastError {
    /// The transport failure behind this error, if any.
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::OpenWriter { source, .. }
            | Self::Write { source, .. }
            | Self::Finish { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The connection the failure is attributed to, if any.
    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionId> {
        match self {
            Self::OpenWriter { connection, .. }
            | Self::Write { connection, .. }
            | Self::Finish { connection, .. } => Some(connection),
            _ => None,
        }
    }
}

type WorkQueue = AsyncMutex<mpsc::Receiver<Arc<dyn Connection>>>;

/// Slot keeping the first error reported by any worker.
#[derive(Default)]
struct FirstError(Mutex<Option<BroadcastError>>);

impl FirstError {
    fn record(&self, err: BroadcastError) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<BroadcastError> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Workers of one broadcast job.
///
/// If the broadcast future is dropped before the workers are joined, the job
/// is cancelled and the workers are left to wind down on their own rather
/// than being aborted mid-write.
struct WorkerPool {
    workers: JoinSet<()>,
    job: CancellationToken,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.job.cancel();
            self.workers.detach_all();
        }
    }
}

/// The broadcast fan-out engine.
///
/// Owns the connection [`Registry`]. Delivery to different connections runs
/// concurrently, at most `concurrency` at a time.
pub struct Broadcaster {
    registry: Registry,
    concurrency: usize,
    closed: AtomicBool,
}

impl Broadcaster {
    /// Create a broadcaster with a pool of `concurrency` workers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConcurrency`] if `concurrency` is zero.
    pub fn new(concurrency: usize) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        debug!(concurrency, "Creating broadcaster");
        Ok(Self {
            registry: Registry::new(),
            concurrency,
            closed: AtomicBool::new(false),
        })
    }

    /// Give each connection at most `timeout` to close during
    /// [`close_connections`](Self::close_connections).
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.registry = Registry::with_close_timeout(timeout);
        self
    }

    /// Width of the worker pool.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Whether [`close_connections`](Self::close_connections) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered connections.
    pub async fn subscriber_count(&self) -> usize {
        self.registry.len().await
    }

    /// Register a connection for future broadcasts.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Closed`] after shutdown; the connection is
    /// closed before returning.
    pub async fn register(&self, connection: Arc<dyn Connection>) -> Result<(), BroadcastError> {
        match self.registry.register(connection).await {
            Ok(()) => Ok(()),
            Err(Sealed(connection)) => {
                debug!(connection = %connection.id(), "Rejecting registration after shutdown");
                if let Err(e) = connection.close().await {
                    warn!(connection = %connection.id(), error = %e, "Error while closing rejected connection");
                }
                Err(BroadcastError::Closed)
            }
        }
    }

    /// Close every registered connection and stop accepting work.
    pub async fn close_connections(&self) -> CloseReport {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.seal().await;
        self.registry.close_all().await
    }

    /// Send `payload` as a `kind` message to every registered connection.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the workers, [`BroadcastError::Cancelled`]
    /// if `ctx` was cancelled first, or [`BroadcastError::Closed`] after
    /// shutdown.
    pub async fn broadcast(
        &self,
        ctx: &CancellationToken,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), BroadcastError> {
        self.broadcast_message(ctx, Message::new(kind, payload)).await
    }

    /// Send an already built message to every registered connection.
    ///
    /// # Errors
    ///
    /// See [`broadcast`](Self::broadcast).
    pub async fn broadcast_message(
        &self,
        ctx: &CancellationToken,
        message: Message,
    ) -> Result<(), BroadcastError> {
        if self.is_closed() {
            return Err(BroadcastError::Closed);
        }

        let start = Instant::now();
        let connections = self.registry.snapshot().await;
        let subscribers = connections.len();
        debug!(
            message_id = message.id,
            kind = %message.kind,
            bytes = message.payload_size(),
            subscribers,
            "Broadcasting"
        );

        let job = ctx.child_token();
        let first_error = Arc::new(FirstError::default());
        let message = Arc::new(message);
        let (tx, rx) = mpsc::channel::<Arc<dyn Connection>>(self.concurrency);
        let queue: Arc<WorkQueue> = Arc::new(AsyncMutex::new(rx));

        let mut pool = WorkerPool {
            workers: JoinSet::new(),
            job: job.clone(),
        };
        for _ in 0..self.concurrency {
            let job = job.clone();
            let queue = Arc::clone(&queue);
            let message = Arc::clone(&message);
            let first_error = Arc::clone(&first_error);

            pool.workers.spawn(async move {
                if let Err(e) = run_worker(&job, &queue, &message).await {
                    first_error.record(e);
                    job.cancel();
                }
            });
        }
        // Only workers hold the queue, so the feeder sees a send error if
        // they all exit.
        drop(queue);

        for connection in connections {
            tokio::select! {
                biased;

                _ = job.cancelled() => break,

                sent = tx.send(connection) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        while let Some(joined) = pool.workers.join_next().await {
            if let Err(e) = joined {
                first_error.record(BroadcastError::WorkerPanicked(e.to_string()));
                job.cancel();
            }
        }

        match first_error.take() {
            Some(err) => {
                debug!(message_id = message.id, error = %err, "Broadcast failed");
                Err(err)
            }
            None => {
                debug!(
                    message_id = message.id,
                    subscribers,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "Broadcast complete"
                );
                Ok(())
            }
        }
    }
}

/// Drain the queue until it is closed or the job is cancelled.
async fn run_worker(
    job: &CancellationToken,
    queue: &WorkQueue,
    message: &Message,
) -> Result<(), BroadcastError> {
    loop {
        let next = tokio::select! {
            biased;

            _ = job.cancelled() => return Err(BroadcastError::Cancelled),

            next = async { queue.lock().await.recv().await } => next,
        };

        let Some(connection) = next else {
            return Ok(());
        };

        deliver(connection.as_ref(), message).await?;
    }
}

/// Open a writer, write the whole payload, finish. Strictly in that order.
async fn deliver(connection: &dyn Connection, message: &Message) -> Result<(), BroadcastError> {
    let id = connection.id();

    let mut writer = connection
        .next_writer(message.kind)
        .await
        .map_err(|source| BroadcastError::OpenWriter {
            connection: id.clone(),
            source,
        })?;

    let payload = &message.payload[..];
    let mut written = 0;
    while written < payload.len() {
        let accepted = writer
            .write(&payload[written..])
            .await
            .map_err(|source| BroadcastError::Write {
                connection: id.clone(),
                source,
            })?;

        if accepted == 0 {
            return Err(BroadcastError::Write {
                connection: id.clone(),
                source: TransportError::WriteZero,
            });
        }
        written += accepted.min(payload.len() - written);
    }

    writer
        .finish()
        .await
        .map_err(|source| BroadcastError::Finish {
            connection: id.clone(),
            source,
        })?;

    trace!(connection = %id, message_id = message.id, bytes = payload.len(), "Delivered");
    Ok(())
}
