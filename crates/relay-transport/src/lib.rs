//! # relay-transport
//!
//! Connection contract for the Relay fan-out server.
//!
//! Everything the broadcast engine needs from a transport fits in two traits:
//!
//! - **Connection** - opens a writer per outbound message, closes the transport
//! - **MessageWriter** - accepts (possibly partial) writes, then finishes the frame
//!
//! ## Implementations
//!
//! - `websocket` (default feature) - adapter over the send half of an axum WebSocket
//! - `memory` - in-memory connection for tests
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{Connection, MessageKind, TransportError};
//!
//! async fn send(conn: &dyn Connection, payload: &[u8]) -> Result<(), TransportError> {
//!     let mut writer = conn.next_writer(MessageKind::Text).await?;
//!     let mut written = 0;
//!     while written < payload.len() {
//!         written += writer.write(&payload[written..]).await?;
//!     }
//!     writer.finish().await
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "memory")]
pub mod memory;

pub use traits::{Connection, ConnectionId, MessageKind, MessageWriter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WsConnection};

#[cfg(feature = "memory")]
pub use memory::{ConcurrencyProbe, FailAt, MemoryConnection, ReceivedMessage};
