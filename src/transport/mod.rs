//! The `transport` module is the boundary between the consumer group core
//! and the broker.
//!
//! The core only requires an ordered, reliable connection that moves whole
//! packets and signals closure. Two connectors are provided: an in-memory
//! channel pair used by tests and embedding applications, and a WebSocket
//! connector that frames packets as JSON text messages.

pub mod memory;
pub mod packet;
pub mod websocket;

use std::future::Future;

use crate::utils::error::Result;

pub use memory::{BrokerLink, MemoryAcceptor, MemoryConnection, MemoryConnector};
pub use packet::{Packet, Publish, QoS, TopicSubscription};
pub use websocket::{WebSocketConnection, WebSocketConnector};

/// An established link to the broker.
pub trait Connection: Send + 'static {
    /// Writes one packet. Packets arrive at the broker in the order written.
    fn send(&mut self, packet: Packet) -> impl Future<Output = Result<()>> + Send;

    /// Reads the next packet. `Ok(None)` means the peer closed the link.
    ///
    /// Must be cancel-safe: dropping the future before it resolves never
    /// loses a packet.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Packet>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens new links to the broker. Called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn open(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}
