//! Connection lifecycle and reconnect pacing.
//!
//! `ReconnectController` is the only writer of `ConnectionState`. It decides
//! the clean-start flag of each CONNECT and how long to wait before the next
//! attempt; the engine performs the actual I/O.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Exponential backoff doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for `attempt` before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.config
            .min
            .saturating_mul(factor)
            .min(self.config.max)
            .max(self.config.min)
    }

    /// Delay before the next attempt; each call counts as one attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(factor).min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug)]
pub struct ReconnectController {
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    stable_grace: Duration,
    clean_start: bool,
    connected_at: Option<Instant>,
}

impl ReconnectController {
    /// `clean_start` is the startup request; it only applies until the
    /// broker first accepts a connection.
    pub fn new(
        clean_start: bool,
        backoff: BackoffConfig,
        stable_grace: Duration,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let controller = Self {
            state: tx,
            backoff: Backoff::new(backoff),
            stable_grace,
            clean_start,
            connected_at: None,
        };
        (controller, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&mut self, next: ConnectionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Unexpected connection state change {current:?} -> {next:?}");
        }
        debug!("Connection state {current:?} -> {next:?}");
        self.state.send_replace(next);
    }

    /// Enters `Connecting` and returns the clean-start flag for CONNECT.
    pub fn begin_connect(&mut self) -> bool {
        self.transition(ConnectionState::Connecting);
        self.clean_start
    }

    pub fn connected(&mut self, now: Instant) {
        self.clean_start = false;
        self.connected_at = Some(now);
        self.transition(ConnectionState::Connected);
    }

    /// Records the loss of an established link and returns how long to wait
    /// before reconnecting. A link that stayed up for the grace period
    /// restarts the backoff from the minimum.
    pub fn link_lost(&mut self, now: Instant) -> Duration {
        if let Some(since) = self.connected_at.take() {
            if now.saturating_duration_since(since) >= self.stable_grace {
                self.backoff.reset();
            }
        }
        self.transition(ConnectionState::Reconnecting);
        self.backoff.next_delay()
    }

    /// Records a failed connect attempt and returns the delay before the
    /// next one.
    pub fn attempt_failed(&mut self) -> Duration {
        self.transition(ConnectionState::Reconnecting);
        self.backoff.next_delay()
    }

    pub fn shutdown(&mut self) {
        self.connected_at = None;
        self.transition(ConnectionState::Disconnected);
    }
}
