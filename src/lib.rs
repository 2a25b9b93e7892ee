//! # sharedsub
//!
//! `sharedsub` is the core of a durable, shared-load MQTT consumer group:
//! persistent sessions, QoS 1 and QoS 2 acknowledgment handshakes, automatic
//! reconnection and client-side dispatch for shared subscriptions.
//!
//! ## Core Modules
//!
//! - `client`: the engine task owning the broker link plus the `ClientHandle` API.
//! - `config`: layered configuration from file, environment and defaults.
//! - `delivery`: packet identifier allocation, dedup and ack handshakes.
//! - `dispatch`: topic filters and per-topic handler lanes.
//! - `persistence`: storage backends for session records (`sled`, in-memory).
//! - `publisher`: in-flight window and publish submissions.
//! - `session`: the per-client state that survives reconnects and restarts.
//! - `transport`: the `Connector`/`Connection` boundary and its implementations.
//! - `utils`: error taxonomy and logging setup.

pub mod client;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod persistence;
pub mod publisher;
pub mod session;
pub mod transport;
pub mod utils;

pub use client::{Client, ClientHandle, ClientOptions, ConnectionState};
pub use dispatch::{HandlerError, HandlerId, HandlerResult, TopicFilter};
pub use publisher::{Submission, WindowFullPolicy};
pub use session::{ClientIdentity, SessionStore};
pub use transport::{MemoryConnector, Packet, Publish, QoS, WebSocketConnector};
pub use utils::error::{Error, Result};
