//! Persistence layer backed by `sled`
//!
//! Session records live in a dedicated `sessions` tree keyed by client
//! identity. The database is opened lazily and reopened after an I/O error,
//! so a medium that was unavailable at startup is picked up again once it
//! recovers. Every operation acquires the handle under a mutex guard that is
//! released on all exit paths.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sled::{Db, Tree};
use tracing::{debug, info, warn};

use super::SessionBackend;
use crate::utils::error::{Error, Result};

const SESSIONS_TREE: &str = "sessions";

pub struct SledBackend {
    path: PathBuf,
    db: Mutex<Option<Db>>,
}

impl SledBackend {
    /// Opens or creates a sled database at `path`. Failing to open is not an
    /// error here; the first operation reports `StorageUnavailable` instead.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let db = match sled::open(&path) {
            Ok(db) => {
                info!("Opened session database at {}", path.display());
                Some(db)
            }
            Err(e) => {
                warn!("Session database at {} unavailable: {e}", path.display());
                None
            }
        };
        Self {
            path,
            db: Mutex::new(db),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_tree<T>(&self, op: impl FnOnce(&Tree) -> sled::Result<T>) -> Result<T> {
        let mut guard = match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.is_none() {
            debug!("Reopening session database at {}", self.path.display());
            *guard = Some(sled::open(&self.path)?);
        }

        let result = guard
            .as_ref()
            .ok_or_else(|| Error::StorageUnavailable("database not open".to_string()))
            .and_then(|db| db.open_tree(SESSIONS_TREE).map_err(Error::from))
            .and_then(|tree| op(&tree).map_err(Error::from));

        if result.is_err() {
            // force a reopen on the next operation
            guard.take();
        }
        result
    }
}

impl SessionBackend for SledBackend {
    fn load(&self, client_id: &str) -> Result<Option<Vec<u8>>> {
        self.with_tree(|tree| Ok(tree.get(client_id.as_bytes())?.map(|v| v.to_vec())))
    }

    fn store(&self, client_id: &str, record: &[u8]) -> Result<()> {
        self.with_tree(|tree| {
            tree.insert(client_id.as_bytes(), record)?;
            tree.flush()?;
            Ok(())
        })
    }

    fn remove(&self, client_id: &str) -> Result<()> {
        self.with_tree(|tree| {
            tree.remove(client_id.as_bytes())?;
            tree.flush()?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for SledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("path", &self.path)
            .field("db", &"sled::Db")
            .finish()
    }
}
