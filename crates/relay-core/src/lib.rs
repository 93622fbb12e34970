//! # relay-core
//!
//! Broadcast fan-out for the Relay pub/sub server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - The set of subscribed connections
//! - **Broadcaster** - Bounded-concurrency fan-out of one message to every connection
//! - **Lifecycle** - Subscribe/publish entry points and shutdown
//! - **Message** - Immutable published message
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Lifecycle  │────▶│ Broadcaster │────▶│ Connections │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Registry   │
//!                     └─────────────┘
//! ```

pub mod broadcast;
pub mod lifecycle;
pub mod message;
pub mod registry;

pub use broadcast::{BroadcastError, Broadcaster, ConfigError};
pub use lifecycle::Lifecycle;
pub use message::Message;
pub use registry::{CloseReport, Registry};

pub use tenvis_relay_transport::{Connection, ConnectionId, MessageKind, TransportError};
pub use tokio_util::sync::CancellationToken;
