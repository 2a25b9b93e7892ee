//! The `client` module ties the core together: a background engine that
//! owns the broker link and a cloneable `ClientHandle` for the application.
//!
//! ```no_run
//! # async fn demo() -> sharedsub::Result<()> {
//! use sharedsub::{Client, ClientIdentity, ClientOptions, QoS, SessionStore, WebSocketConnector};
//!
//! let options = ClientOptions::new(ClientIdentity::for_consumer());
//! let client = Client::start(
//!     options,
//!     WebSocketConnector::new("ws://localhost:8084/mqtt"),
//!     SessionStore::sled("sharedsub_db"),
//! );
//! let handle = client.handle().clone();
//! handle.register_handler("$share/group1/device/+/data", |topic, payload, _qos| {
//!     println!("{topic}: {}", String::from_utf8_lossy(payload));
//!     Ok(())
//! })?;
//! handle.subscribe("$share/group1/device/+/data", QoS::AtLeastOnce).await?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod engine;
pub mod handle;
pub mod reconnect;

use std::time::Duration;

use crate::config::Settings;
use crate::publisher::WindowFullPolicy;
use crate::session::ClientIdentity;

pub use handle::{Client, ClientHandle};
pub use reconnect::{Backoff, BackoffConfig, ConnectionState, ReconnectController};

/// Runtime options of a client, usually built from `Settings`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: ClientIdentity,
    pub clean_start: bool,
    pub connect_timeout: Duration,
    pub reconnect: BackoffConfig,
    /// A link that stayed up this long resets the reconnect backoff.
    pub stable_grace: Duration,
    pub persist_retry: BackoffConfig,
    pub max_inflight: usize,
    pub window_full: WindowFullPolicy,
}

impl ClientOptions {
    /// Options with the default settings for `client_id`.
    pub fn new(client_id: ClientIdentity) -> Self {
        Self::from_settings(&Settings::default(), client_id)
    }

    /// `fallback_id` is used when the settings carry no client id.
    pub fn from_settings(settings: &Settings, fallback_id: ClientIdentity) -> Self {
        let client_id = settings
            .client
            .id
            .as_deref()
            .map(ClientIdentity::new)
            .unwrap_or(fallback_id);

        Self {
            client_id,
            clean_start: settings.client.clean_start,
            connect_timeout: Duration::from_millis(settings.client.connect_timeout_ms),
            reconnect: BackoffConfig {
                min: Duration::from_millis(settings.reconnect.min_backoff_ms),
                max: Duration::from_millis(settings.reconnect.max_backoff_ms),
                jitter: settings.reconnect.jitter,
            },
            stable_grace: Duration::from_millis(settings.reconnect.stable_grace_ms),
            persist_retry: BackoffConfig {
                min: Duration::from_millis(settings.session.persist_retry_min_ms),
                max: Duration::from_millis(settings.session.persist_retry_max_ms),
                jitter: settings.reconnect.jitter,
            },
            max_inflight: settings.publisher.max_inflight,
            window_full: settings.publisher.window_full,
        }
    }
}

#[cfg(test)]
mod tests;
