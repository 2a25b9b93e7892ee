//! The `session` module holds the per-client state that survives reconnects
//! and process restarts: subscriptions and the ordered lists of unfinished
//! inbound and outbound messages.
//!
//! A `Session` is shared between the reconnection path (resubscribe and
//! replay) and acknowledgment handling through a single `SharedSession`
//! lock. Callers never hold that lock across an await point.

pub mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dispatch::TopicFilter;
use crate::transport::{Publish, QoS, TopicSubscription};

pub use store::SessionStore;

pub type SharedSession = Arc<Mutex<Session>>;

/// Identifies a session; must stay the same across reconnects for the broker
/// to resume it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `consumer-<pid>`, the identity a consumer process uses by default.
    pub fn for_consumer() -> Self {
        Self(format!("consumer-{}", std::process::id()))
    }

    /// `publisher-<uuid>`, unique per publisher process.
    pub fn for_publisher() -> Self {
        Self(format!("publisher-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Progress of one message through its acknowledgment handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Outbound only: accepted, waiting for room in the in-flight window.
    Queued,
    /// Outbound: PUBLISH written. Inbound: handed to the dispatcher.
    Sent,
    /// QoS 2 midway: PUBREC received (outbound) or emitted (inbound).
    AcknowledgedPartial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub state: DeliveryState,
    /// Milliseconds since the UNIX epoch of the last state change.
    pub timestamp: i64,
    /// Set once an acknowledged inbound record has dropped its payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<[u8; 32]>,
}

/// SHA-256 over topic and payload. Identifies an inbound message after its
/// payload has been released.
pub fn message_fingerprint(topic: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&hasher.finalize());
    fingerprint
}

impl InFlightMessage {
    pub fn new(
        packet_id: u16,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: QoS,
        state: DeliveryState,
    ) -> Self {
        Self {
            packet_id,
            topic: topic.into(),
            payload,
            qos,
            state,
            timestamp: Utc::now().timestamp_millis(),
            fingerprint: None,
        }
    }

    pub fn is_unacknowledged(&self) -> bool {
        self.state != DeliveryState::Complete
    }

    pub fn set_state(&mut self, state: DeliveryState) {
        self.state = state;
        self.timestamp = Utc::now().timestamp_millis();
    }

    /// Keeps only the fingerprint of the message. Inbound records no longer
    /// need the payload once the handlers have accepted it.
    pub fn release_payload(&mut self) {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(message_fingerprint(&self.topic, &self.payload));
        }
        self.payload = Vec::new();
    }

    /// Whether this record describes the message `topic`/`payload`.
    pub fn carries(&self, topic: &str, payload: &[u8]) -> bool {
        match self.fingerprint {
            Some(fingerprint) => fingerprint == message_fingerprint(topic, payload),
            None => self.topic == topic && self.payload == payload,
        }
    }

    pub fn to_publish(&self, dup: bool) -> Publish {
        Publish {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            packet_id: Some(self.packet_id),
            dup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub filter: TopicFilter,
    pub qos: QoS,
}

impl From<&Subscription> for TopicSubscription {
    fn from(subscription: &Subscription) -> Self {
        TopicSubscription {
            filter: subscription.filter.as_str().to_string(),
            qos: subscription.qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub client_id: ClientIdentity,
    pub clean_start: bool,
    pub subscriptions: Vec<Subscription>,
    pub pending_inbound: Vec<InFlightMessage>,
    pub pending_outbound: Vec<InFlightMessage>,
}

impl Session {
    pub fn new(client_id: ClientIdentity, clean_start: bool) -> Self {
        Self {
            client_id,
            clean_start,
            subscriptions: Vec::new(),
            pending_inbound: Vec::new(),
            pending_outbound: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Adds a subscription or updates the QoS of an existing one. Returns
    /// false when nothing changed.
    pub fn add_subscription(&mut self, filter: TopicFilter, qos: QoS) -> bool {
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) if existing.qos == qos => false,
            Some(existing) => {
                existing.qos = qos;
                true
            }
            None => {
                self.subscriptions.push(Subscription { filter, qos });
                true
            }
        }
    }

    pub fn remove_subscription(&mut self, filter: &TopicFilter) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| &s.filter != filter);
        before != self.subscriptions.len()
    }

    pub fn inbound_mut(&mut self, packet_id: u16) -> Option<&mut InFlightMessage> {
        self.pending_inbound
            .iter_mut()
            .find(|m| m.packet_id == packet_id)
    }

    pub fn outbound_mut(&mut self, packet_id: u16) -> Option<&mut InFlightMessage> {
        self.pending_outbound
            .iter_mut()
            .find(|m| m.packet_id == packet_id)
    }

    pub fn remove_inbound(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        let idx = self
            .pending_inbound
            .iter()
            .position(|m| m.packet_id == packet_id)?;
        Some(self.pending_inbound.remove(idx))
    }

    pub fn remove_outbound(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        let idx = self
            .pending_outbound
            .iter()
            .position(|m| m.packet_id == packet_id)?;
        Some(self.pending_outbound.remove(idx))
    }

    /// Identifiers of messages still awaiting acknowledgment in `direction`.
    pub fn unacknowledged_ids(&self, direction: Direction) -> BTreeSet<u16> {
        let records = match direction {
            Direction::Inbound => &self.pending_inbound,
            Direction::Outbound => &self.pending_outbound,
        };
        records
            .iter()
            .filter(|m| m.is_unacknowledged())
            .map(|m| m.packet_id)
            .collect()
    }

    /// Drops inbound records whose handler never reported back, so the
    /// broker's redelivery is handled as a fresh message. Returns how many
    /// were dropped.
    pub fn drop_unfinished_inbound(&mut self) -> usize {
        let before = self.pending_inbound.len();
        self.pending_inbound
            .retain(|m| m.state != DeliveryState::Sent);
        before - self.pending_inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.pending_inbound.is_empty()
            && self.pending_outbound.is_empty()
    }
}
