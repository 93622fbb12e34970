//! Startup and shutdown coordination.
//!
//! [`Lifecycle`] is what the HTTP layer talks to: it forwards subscriptions
//! and publishes to the [`Broadcaster`] and owns the shutdown signal that
//! long-lived subscriber tasks wait on.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tenvis_relay_transport::{Connection, MessageKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::{BroadcastError, Broadcaster, ConfigError};
use crate::registry::CloseReport;

/// Coordinates the broadcaster with process shutdown.
pub struct Lifecycle {
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
}

impl Lifecycle {
    /// Create a lifecycle around a new broadcaster.
    ///
    /// # Errors
    ///
    /// Returns an error if `concurrency` is zero.
    pub fn new(concurrency: usize) -> Result<Self, ConfigError> {
        Ok(Self::with_broadcaster(Broadcaster::new(concurrency)?))
    }

    /// Create a lifecycle around an existing broadcaster.
    #[must_use]
    pub fn with_broadcaster(broadcaster: Broadcaster) -> Self {
        Self {
            broadcaster,
            shutdown: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The underlying broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Register a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Closed`] after shutdown.
    pub async fn subscribe(&self, connection: Arc<dyn Connection>) -> Result<(), BroadcastError> {
        self.broadcaster.register(connection).await
    }

    /// Deliver `payload` to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns the broadcast's first failure.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), BroadcastError> {
        self.broadcaster.broadcast(ctx, kind, payload).await
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count().await
    }

    /// Token cancelled when shutdown starts.
    ///
    /// Subscriber tasks wait on it; publish contexts derived from it with
    /// `child_token` are cancelled by shutdown too.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shut down: signal subscriber tasks, then close every connection.
    ///
    /// Only the first call does anything and returns a report; later calls
    /// return `None`.
    pub async fn shutdown(&self) -> Option<CloseReport> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!("Shutting down relay");
        self.shutdown.cancel();
        let report = self.broadcaster.close_connections().await;
        info!(
            closed = report.closed,
            failed = report.failed,
            "Relay shut down"
        );
        Some(report)
    }
}
