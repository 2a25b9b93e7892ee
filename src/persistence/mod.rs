//! The `persistence` module provides the storage media session records are
//! written to.
//!
//! A backend stores opaque records keyed by client identity. Writing a record
//! must replace the previous one atomically: either the new record is durable
//! or the old one is still intact. The default backend is `sled`, an embedded
//! key-value store; an in-memory backend serves tests and ephemeral clients.

pub mod memory;
pub mod sled_store;

use std::fmt::Debug;

use crate::utils::error::Result;

pub use memory::MemoryBackend;
pub use sled_store::SledBackend;

pub trait SessionBackend: Send + Sync + Debug {
    fn load(&self, client_id: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically replaces the record for `client_id`.
    fn store(&self, client_id: &str, record: &[u8]) -> Result<()>;

    fn remove(&self, client_id: &str) -> Result<()>;
}
