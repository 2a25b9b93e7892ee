//! Session store
//!
//! `restore` resumes or replaces the session for a client identity and
//! `persist` writes it back. The session is serialized completely before the
//! backend is touched, and the backend swaps the stored record in a single
//! atomic write, so a failure at any point leaves the previous durable state
//! as it was.
//!
//! Storage failures are never fatal. `restore` falls back to an empty
//! in-memory session and `persist` reports `StorageUnavailable`, leaving the
//! caller to keep running from memory and retry later.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ClientIdentity, Session};
use crate::persistence::{MemoryBackend, SessionBackend, SledBackend};
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    pub fn new(backend: impl SessionBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn with_backend(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    pub fn sled(path: impl AsRef<Path>) -> Self {
        Self::new(SledBackend::new(path))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Returns the prior session for `client_id` unmodified when
    /// `clean_start` is false and one exists; otherwise discards any prior
    /// session and returns an empty one.
    pub fn restore(&self, client_id: &ClientIdentity, clean_start: bool) -> Session {
        if clean_start {
            if let Err(e) = self.backend.remove(client_id.as_str()) {
                warn!("Could not discard stored session for {client_id}: {e}");
            }
            info!("Starting clean session for {client_id}");
            return Session::new(client_id.clone(), true);
        }

        match self.backend.load(client_id.as_str()) {
            Ok(Some(record)) => match serde_json::from_slice::<Session>(&record) {
                Ok(mut session) => {
                    // the stored flag reflects the previous startup's request
                    session.clean_start = false;
                    info!(
                        "Restored session for {client_id}: {} subscriptions, {} inbound and {} outbound pending",
                        session.subscriptions.len(),
                        session.pending_inbound.len(),
                        session.pending_outbound.len()
                    );
                    session
                }
                Err(e) => {
                    warn!("Stored session for {client_id} is unreadable ({e}); starting empty");
                    Session::new(client_id.clone(), false)
                }
            },
            Ok(None) => {
                debug!("No stored session for {client_id}");
                Session::new(client_id.clone(), false)
            }
            Err(e) => {
                warn!("Session storage unavailable for {client_id} ({e}); starting in memory");
                Session::new(client_id.clone(), false)
            }
        }
    }

    pub fn persist(&self, session: &Session) -> Result<()> {
        let record = serde_json::to_vec(session).map_err(|e| {
            Error::StorageUnavailable(format!("failed to serialize session: {e}"))
        })?;
        self.backend.store(session.client_id.as_str(), &record)
    }

    pub fn discard(&self, client_id: &ClientIdentity) -> Result<()> {
        self.backend.remove(client_id.as_str())
    }
}
