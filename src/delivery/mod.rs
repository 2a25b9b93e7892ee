//! The `delivery` module implements the QoS 1 and QoS 2 acknowledgment
//! handshakes for both directions and deduplicates redeliveries.
//!
//! All state lives in the shared `Session`, so whatever the tracker records
//! is persisted with the session and survives a restart mid-handshake.

pub mod packet_id;
pub mod tracker;

pub use tracker::{DeliveryTracker, InboundAction};
