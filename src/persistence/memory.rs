use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::SessionBackend;
use crate::utils::error::Result;

/// Process-local backend. Clones share the same records, which lets tests
/// model a process restart by building a new store over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self, client_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records().get(client_id).cloned())
    }

    fn store(&self, client_id: &str, record: &[u8]) -> Result<()> {
        self.records()
            .insert(client_id.to_string(), record.to_vec());
        Ok(())
    }

    fn remove(&self, client_id: &str) -> Result<()> {
        self.records().remove(client_id);
        Ok(())
    }
}
