//! Packet definitions for the broker protocol boundary.
//!
//! The core only needs the logical content of each control packet; byte
//! level encoding belongs to the `Connection` implementation. Packets derive
//! serde with an internal `type` tag so the WebSocket connector can frame
//! them as JSON text messages.

use serde::{Deserialize, Serialize};

use crate::utils::error::Error;

/// Delivery guarantee requested for a message or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// QoS 1 and 2 messages carry a packet identifier and are tracked.
    pub fn is_tracked(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::ProtocolViolation(format!("invalid QoS level {other}"))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Application message as carried by a PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<u16>,
    #[serde(default)]
    pub dup: bool,
}

impl Publish {
    /// Checks that the packet identifier is present exactly when the QoS
    /// level requires one.
    pub fn validate(&self) -> Result<(), Error> {
        match (self.qos.is_tracked(), self.packet_id) {
            (true, None) | (true, Some(0)) => Err(Error::ProtocolViolation(format!(
                "QoS {} publish on '{}' without a packet identifier",
                u8::from(self.qos),
                self.topic
            ))),
            (false, Some(id)) => Err(Error::ProtocolViolation(format!(
                "QoS 0 publish on '{}' carries packet identifier {id}",
                self.topic
            ))),
            _ => Ok(()),
        }
    }
}

/// One entry of a SUBSCRIBE request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "connect")]
    Connect { client_id: String, clean_start: bool },

    #[serde(rename = "connack")]
    ConnAck { session_present: bool },

    #[serde(rename = "subscribe")]
    Subscribe {
        packet_id: u16,
        subscriptions: Vec<TopicSubscription>,
    },

    /// `granted` holds one entry per requested filter; `None` is a refusal.
    #[serde(rename = "suback")]
    SubAck {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { packet_id: u16, filters: Vec<String> },

    #[serde(rename = "unsuback")]
    UnsubAck { packet_id: u16 },

    #[serde(rename = "publish")]
    Publish(Publish),

    #[serde(rename = "puback")]
    PubAck { packet_id: u16 },

    #[serde(rename = "pubrec")]
    PubRec { packet_id: u16 },

    #[serde(rename = "pubrel")]
    PubRel { packet_id: u16 },

    #[serde(rename = "pubcomp")]
    PubComp { packet_id: u16 },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Packet {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect { .. } => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PubRec { .. } => "PUBREC",
            Packet::PubRel { .. } => "PUBREL",
            Packet::PubComp { .. } => "PUBCOMP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
