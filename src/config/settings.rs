use serde::Deserialize;

use crate::publisher::WindowFullPolicy;

/// Top-level configuration settings for the application.
///
/// Groups the client identity, session storage, reconnection, publisher flow
/// control and logging sections.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub client: ClientSettings,
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
    pub publisher: PublisherSettings,
    pub logging: LoggingSettings,
}

/// Identity and broker endpoint of the client.
///
/// `id` is optional: the binaries derive one from the process when unset.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub id: Option<String>,
    pub broker_url: String,
    pub clean_start: bool,
    pub connect_timeout_ms: u64,
}

/// Where session state is persisted.
///
/// `backend` is `sled` or `memory`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub backend: String,
    pub path: String,
    pub persist_retry_min_ms: u64,
    pub persist_retry_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: f64,
    pub stable_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub max_inflight: usize,
    pub window_full: WindowFullPolicy,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub client: Option<PartialClientSettings>,
    pub session: Option<PartialSessionSettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub id: Option<String>,
    pub broker_url: Option<String>,
    pub clean_start: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub backend: Option<String>,
    pub path: Option<String>,
    pub persist_retry_min_ms: Option<u64>,
    pub persist_retry_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialReconnectSettings {
    pub min_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub jitter: Option<f64>,
    pub stable_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPublisherSettings {
    pub max_inflight: Option<usize>,
    pub window_full: Option<WindowFullPolicy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Mirrors the demo deployment: a local broker on the MQTT WebSocket port and
/// persistent sessions.
impl Default for Settings {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                id: None,
                broker_url: "ws://localhost:8084/mqtt".to_string(),
                clean_start: false,
                connect_timeout_ms: 10_000,
            },
            session: SessionSettings {
                backend: "sled".to_string(),
                path: "sharedsub_db".to_string(),
                persist_retry_min_ms: 200,
                persist_retry_max_ms: 10_000,
            },
            reconnect: ReconnectSettings {
                min_backoff_ms: 500,
                max_backoff_ms: 30_000,
                jitter: 0.2,
                stable_grace_ms: 10_000,
            },
            publisher: PublisherSettings {
                max_inflight: 16,
                window_full: WindowFullPolicy::Block,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlays every value present in `self` onto `base`.
    pub fn merge_onto(self, base: Settings) -> Settings {
        let client = self.client.unwrap_or_default();
        let session = self.session.unwrap_or_default();
        let reconnect = self.reconnect.unwrap_or_default();
        let publisher = self.publisher.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            client: ClientSettings {
                id: client.id.or(base.client.id),
                broker_url: client.broker_url.unwrap_or(base.client.broker_url),
                clean_start: client.clean_start.unwrap_or(base.client.clean_start),
                connect_timeout_ms: client
                    .connect_timeout_ms
                    .unwrap_or(base.client.connect_timeout_ms),
            },
            session: SessionSettings {
                backend: session.backend.unwrap_or(base.session.backend),
                path: session.path.unwrap_or(base.session.path),
                persist_retry_min_ms: session
                    .persist_retry_min_ms
                    .unwrap_or(base.session.persist_retry_min_ms),
                persist_retry_max_ms: session
                    .persist_retry_max_ms
                    .unwrap_or(base.session.persist_retry_max_ms),
            },
            reconnect: ReconnectSettings {
                min_backoff_ms: reconnect
                    .min_backoff_ms
                    .unwrap_or(base.reconnect.min_backoff_ms),
                max_backoff_ms: reconnect
                    .max_backoff_ms
                    .unwrap_or(base.reconnect.max_backoff_ms),
                jitter: reconnect.jitter.unwrap_or(base.reconnect.jitter),
                stable_grace_ms: reconnect
                    .stable_grace_ms
                    .unwrap_or(base.reconnect.stable_grace_ms),
            },
            publisher: PublisherSettings {
                max_inflight: publisher
                    .max_inflight
                    .unwrap_or(base.publisher.max_inflight),
                window_full: publisher
                    .window_full
                    .unwrap_or(base.publisher.window_full),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(base.logging.level),
            },
        }
    }
}
