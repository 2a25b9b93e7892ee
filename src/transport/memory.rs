//! In-memory transport
//!
//! `MemoryConnector` hands every opened link to a `MemoryAcceptor`, which
//! plays the broker side. Dropping a `BrokerLink` closes the client's
//! connection, which is how tests simulate a dropped network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{Connection, Connector, Packet};
use crate::utils::error::{Error, Result};

#[derive(Debug)]
struct Shared {
    acceptor: UnboundedSender<BrokerLink>,
    available: AtomicBool,
    attempts: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                acceptor: tx,
                available: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
            }),
        };
        (connector, MemoryAcceptor { links: rx })
    }

    /// While unavailable every `open` fails as if the broker refused the
    /// connection.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn open(&self) -> Result<MemoryConnection> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        self.shared
            .acceptor
            .send(BrokerLink {
                to_client,
                from_client,
            })
            .map_err(|_| Error::Transport("no broker is accepting links".to_string()))?;

        Ok(MemoryConnection {
            outgoing: Some(to_broker),
            incoming: from_broker,
        })
    }
}

#[derive(Debug)]
pub struct MemoryAcceptor {
    links: UnboundedReceiver<BrokerLink>,
}

impl MemoryAcceptor {
    /// Waits for the next link opened by the connector.
    pub async fn accept(&mut self) -> Option<BrokerLink> {
        self.links.recv().await
    }
}

/// Client side of an in-memory link.
#[derive(Debug)]
pub struct MemoryConnection {
    outgoing: Option<UnboundedSender<Packet>>,
    incoming: UnboundedReceiver<Packet>,
}

impl Connection for MemoryConnection {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| Error::Transport("link already closed".to_string()))?;
        outgoing
            .send(packet)
            .map_err(|_| Error::Transport("broker closed the link".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Packet>> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.outgoing.take();
        self.incoming.close();
        Ok(())
    }
}

/// Broker side of an in-memory link.
#[derive(Debug)]
pub struct BrokerLink {
    to_client: UnboundedSender<Packet>,
    from_client: UnboundedReceiver<Packet>,
}

impl BrokerLink {
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.to_client
            .send(packet)
            .map_err(|_| Error::Transport("client closed the link".to_string()))
    }

    /// Next packet written by the client, `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.from_client.recv().await
    }

    /// Packet already written by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.from_client.try_recv().ok()
    }
}
