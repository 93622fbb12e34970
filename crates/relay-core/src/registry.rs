//! Connection registry for Relay.
//!
//! The registry is the single set of subscribed connections. It only grows
//! (on subscribe) and is emptied in one go (on shutdown). Broadcasts never
//! iterate the live set; they take a [`snapshot`](Registry::snapshot) under
//! the same lock that guards appends and clears.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_transport::Connection;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long one connection may take to close before it counts as failed.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of closing every registered connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Connections `close` was called on.
    pub closed: usize,
    /// How many of those calls failed.
    pub failed: usize,
}

/// A registration refused by a sealed registry. Carries the connection back.
pub struct Sealed(pub Arc<dyn Connection>);

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sealed").field(self.0.id()).finish()
    }
}

/// The set of subscribed connections.
pub struct Registry {
    inner: RwLock<Inner>,
    close_timeout: Duration,
}

#[derive(Default)]
struct Inner {
    connections: Vec<Arc<dyn Connection>>,
    sealed: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_close_timeout(DEFAULT_CLOSE_TIMEOUT)
    }

    /// Create an empty registry whose `close_all` gives each connection at
    /// most `close_timeout` to close.
    #[must_use]
    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            close_timeout,
        }
    }

    /// Per-connection close deadline.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Add a connection.
    ///
    /// Duplicates are not detected; registering the same connection twice
    /// delivers every message to it twice. Once the registry is
    /// [sealed](Registry::seal) the connection is handed back instead.
    pub async fn register(&self, connection: Arc<dyn Connection>) -> Result<(), Sealed> {
        let mut inner = self.inner.write().await;
        if inner.sealed {
            return Err(Sealed(connection));
        }
        debug!(
            connection = %connection.id(),
            subscribers = inner.connections.len() + 1,
            "Connection registered"
        );
        inner.connections.push(connection);
        Ok(())
    }

    /// Stop accepting registrations.
    ///
    /// Taken under the same lock as `register`, so every connection that got
    /// in before the seal is still there for the next `close_all`.
    pub async fn seal(&self) {
        self.inner.write().await.sealed = true;
    }

    /// Whether the registry stopped accepting registrations.
    pub async fn is_sealed(&self) -> bool {
        self.inner.read().await.sealed
    }

    /// Copy of the current set, for one broadcast pass.
    pub async fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.inner.read().await.connections.clone()
    }

    /// Close every connection and empty the registry.
    ///
    /// Connections are closed concurrently, each under the close timeout.
    /// Failures and timeouts are logged and counted, never returned, so one
    /// broken or stalled connection cannot keep the rest open.
    pub async fn close_all(&self) -> CloseReport {
        let drained = std::mem::take(&mut self.inner.write().await.connections);

        let mut closing = JoinSet::new();
        for connection in drained {
            let limit = self.close_timeout;
            closing.spawn(async move {
                let outcome = match tokio::time::timeout(limit, connection.close()).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("close timed out after {}ms", limit.as_millis())),
                };
                (connection, outcome)
            });
        }

        let mut report = CloseReport::default();
        while let Some(joined) = closing.join_next().await {
            report.closed += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((connection, Err(e))) => {
                    report.failed += 1;
                    warn!(connection = %connection.id(), error = %e, "Error while closing connection");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Close task failed");
                }
            }
        }

        info!(
            closed = report.closed,
            failed = report.failed,
            "Closed all connections"
        );
        report
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Whether no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }
}
