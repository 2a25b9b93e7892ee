//! The `publisher` module paces outbound publishes against the in-flight
//! window.
//!
//! The engine owns a `FlowController` and decides, per publish request,
//! whether it is admitted into the session's outbound queue now or parked
//! until acknowledgments open the window. Callers get a `Submission` back
//! once their publish is admitted.

pub mod flow;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::transport::QoS;
use crate::utils::error::{Error, Result};

pub use flow::FlowController;

/// What `publish` does when `max_inflight` messages are already accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowFullPolicy {
    /// Suspend the caller until the window has room.
    #[default]
    Block,
    /// Admit immediately; transmission waits for room.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// An admitted publish.
#[derive(Debug)]
pub struct Submission {
    packet_id: Option<u16>,
    outcome: oneshot::Receiver<Result<()>>,
}

impl Submission {
    /// A tracked publish; `outcome` fires on PUBACK or PUBCOMP.
    pub(crate) fn pending(packet_id: u16) -> (Self, oneshot::Sender<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let submission = Self {
            packet_id: Some(packet_id),
            outcome: rx,
        };
        (submission, tx)
    }

    /// A QoS 0 publish that was already written.
    pub(crate) fn completed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self {
            packet_id: None,
            outcome: rx,
        }
    }

    /// Packet identifier, `None` for QoS 0.
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Waits for the broker's acknowledgment. Fails with `Shutdown` when the
    /// client stops first; the message then stays in the persisted session.
    pub async fn acknowledged(self) -> Result<()> {
        self.outcome.await.unwrap_or(Err(Error::Shutdown))
    }
}
